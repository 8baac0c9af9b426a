//! Byte link to the controller.
//!
//! [`SerialLink`] is the seam between the device client and the transport.
//! [`SerialAdapter`] drives a real port through the serialport crate, with
//! blocking I/O moved onto Tokio's blocking pool; `MockLink` stands in for
//! tests and dry runs.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Transport used by the device client.
///
/// Frames are written verbatim (they already carry their terminator);
/// responses are newline-delimited lines.
#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Human readable link name.
    fn name(&self) -> &str;

    /// Open (or reopen) the link.
    async fn open(&mut self) -> Result<()>;

    /// Close the link. Closing a closed link is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// True while the link is open.
    fn is_open(&self) -> bool;

    /// Write a complete frame.
    async fn write(&mut self, frame: &str) -> Result<()>;

    /// Read one line, without its line ending. `None` when nothing arrived
    /// within `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Serial adapter for the controller's USB serial port.
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    port_name: String,

    /// Baud rate
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for async access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    #[cfg(not(feature = "instrument_serial"))]
    port: Option<Arc<Mutex<()>>>,
}

impl SerialAdapter {
    /// Create an adapter; the port is not opened yet.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    /// Port this adapter talks to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl SerialLink for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> Result<()> {
        self.port = None;

        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(10))
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        self.port_name, self.baud_rate
                    )
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Cannot open '{}': serial support is disabled",
                self.port_name
            ))
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn write(&mut self, frame: &str) -> Result<()> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", self.port_name))?
            .clone();

        #[cfg(feature = "instrument_serial")]
        {
            let frame = frame.to_string();
            tokio::task::spawn_blocking(move || -> Result<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard
                    .write_all(frame.as_bytes())
                    .context("Failed to write to serial port")?;
                port_guard.flush().context("Failed to flush serial port")?;
                debug!(frame = %frame, "sent");
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port, frame);
            Err(anyhow!("Serial support is disabled"))
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", self.port_name))?
            .clone();

        #[cfg(feature = "instrument_serial")]
        {
            tokio::task::spawn_blocking(move || -> Result<Option<String>> {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let mut line = Vec::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        break;
                    }

                    match port_guard.read(&mut buffer) {
                        Ok(1) => {
                            if buffer[0] == b'\n' {
                                break;
                            }
                            line.push(buffer[0]);
                        }
                        Ok(0) => return Err(anyhow!("Unexpected EOF on serial port")),
                        Ok(_) => return Err(anyhow!("Read into single-byte buffer returned >1")),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                    }
                }

                if line.is_empty() {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                debug!(line = %text, "received");
                Ok(Some(text))
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port, timeout);
            Err(anyhow!("Serial support is disabled"))
        }
    }
}
