//! `katara` command line tool: validate and run saved protocols, toggle
//! valves and drive pumps by hand.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use katara_control::config::{Settings, DEFAULT_CONFIG_FILE};
use katara_control::hardware::mock::MockLink;
use katara_control::hardware::pump::{check_rate_cycles, PumpDirection};
use katara_control::protocol::routine::render_tree;
use katara_control::protocol::{Protocol, RunOutcome};
use katara_control::session::{DeviceSession, ManualPump};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "katara")]
#[command(about = "Run valve and pump protocols on a KATARA controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Args)]
struct Connection {
    /// Serial port of the controller (overrides device.port)
    #[arg(short, long)]
    port: Option<String>,

    /// Use the in-memory controller instead of a serial port
    #[arg(long, conflicts_with = "port")]
    mock: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a saved protocol, print it and check every entry
    Validate {
        /// Saved protocol file
        file: PathBuf,
    },

    /// Run a saved protocol; Ctrl-C cancels
    Run {
        /// Saved protocol file
        file: PathBuf,

        #[command(flatten)]
        connection: Connection,
    },

    /// Flip one valve
    Toggle {
        /// Valve pin
        pin: i64,

        #[command(flatten)]
        connection: Connection,
    },

    /// Run a pump sequence; Ctrl-C stops it
    Pump {
        /// The three pump valves
        #[arg(num_args = 3, required = true)]
        valves: Vec<i64>,

        /// Cycles per second
        #[arg(short, long)]
        rate: i64,

        /// Number of cycles, -1 to pump until stopped
        #[arg(short = 'n', long, allow_hyphen_values = true)]
        cycles: i64,

        /// Cycle the valves in reverse order
        #[arg(long)]
        reverse: bool,

        #[command(flatten)]
        connection: Connection,
    },
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    if settings.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect(session: &DeviceSession, connection: &Connection) -> Result<()> {
    if connection.mock {
        session.connect(Box::new(MockLink::new())).await?;
        info!("connected to mock controller");
        return Ok(());
    }
    let port = connection
        .port
        .clone()
        .or_else(|| session.settings().device.port.clone())
        .ok_or_else(|| anyhow!("No serial port given. Use --port or set device.port."))?;
    session
        .connect_port(&port)
        .await
        .with_context(|| format!("Failed to connect to {port}"))?;
    info!(port = %port, "connected");
    Ok(())
}

async fn run_protocol(session: &DeviceSession, file: PathBuf, connection: &Connection) -> Result<()> {
    let mut protocol = Protocol::load_from_path(&file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    connect(session, connection).await?;
    protocol.run(session).await?;

    // The cancelled run's cleanup finishes before the link is closed.
    let outcome = protocol.wait_or_cancel(interrupted()).await;
    session.disconnect().await;

    match outcome {
        Some(RunOutcome::Completed) => println!("{} completed", protocol.name()),
        Some(RunOutcome::Cancelled) => println!("{} cancelled", protocol.name()),
        Some(RunOutcome::Error(message)) => bail!(message),
        None => {}
    }
    Ok(())
}

/// Resolves on Ctrl-C; never resolves if the signal cannot be watched.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn run_pump(
    session: &DeviceSession,
    valves: &[i64],
    direction: PumpDirection,
    rate: i64,
    cycles: i64,
) -> Result<()> {
    let [v1, v2, v3] = valves else {
        bail!("A pump needs exactly three valves.");
    };
    let run = check_rate_cycles(rate, cycles, true).map_err(|e| anyhow!(e))?;
    let pump = match session.start_pump([*v1, *v2, *v3], direction, rate, cycles).await? {
        ManualPump::Started(pump) => pump,
        ManualPump::Stopped(pump) => {
            println!("{pump} stopped");
            return Ok(());
        }
    };
    println!("{pump} running");

    let finished = async {
        match run.duration() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = finished => println!("{pump} finished"),
        () = interrupted() => {
            session.stop_pump().await?;
            println!("{pump} stopped");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    init_tracing(&settings);
    let session = DeviceSession::with_tracing(settings);

    match cli.command {
        Commands::Validate { file } => {
            let mut protocol = Protocol::load_from_path(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            print!("{}", render_tree(protocol.actions()));
            protocol.validate(&session)?;
            println!("{} is valid", protocol.name());
        }
        Commands::Run { file, connection } => {
            run_protocol(&session, file, &connection).await?;
        }
        Commands::Toggle { pin, connection } => {
            connect(&session, &connection).await?;
            let energized = session.toggle_pin(pin).await?;
            println!("valve {pin} {}", if energized { "energized" } else { "off" });
        }
        Commands::Pump {
            valves,
            rate,
            cycles,
            reverse,
            connection,
        } => {
            connect(&session, &connection).await?;
            let direction = if reverse {
                PumpDirection::Reverse
            } else {
                PumpDirection::Forward
            };
            run_pump(&session, &valves, direction, rate, cycles).await?;
        }
    }
    Ok(())
}
