//! Execution engine.
//!
//! A run is one tokio task that walks a [`ValidatedRoutine`] depth-first.
//! Cancellation is cooperative: a shared flag is polled on every pause tick
//! and before and after every node, and the step that observes it cleans up
//! after itself before the run returns [`RunOutcome::Cancelled`].

use crate::error::{KataraError, CONNECTION_LOST};
use crate::protocol::routine::{NodePath, ValidatedRoutine};
use crate::session::{DeviceSession, RunGuard};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at its next suspension point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether the walk should go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going
    Continue,
    /// Cancellation was observed; unwind without running anything else
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every node ran.
    Completed,
    /// The operator cancelled.
    Cancelled,
    /// A runtime error aborted the run; the message was reported.
    Error(String),
}

/// State shared by every node of one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    session: DeviceSession,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl ExecutionContext {
    /// Context for a run on `session`.
    pub fn new(session: DeviceSession, cancel: CancelToken) -> Self {
        let poll_interval = session.poll_interval();
        Self {
            session,
            cancel,
            poll_interval,
        }
    }

    /// Device session.
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// True once the run was asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep in poll-interval ticks, watching for cancellation.
    ///
    /// `None` waits until cancelled. Elapsed whole seconds are reported to the
    /// renderer as they pass.
    pub async fn pause(&self, path: &NodePath, duration: Option<Duration>) -> Flow {
        let started = Instant::now();
        let deadline = duration.and_then(|d| started.checked_add(d));
        let renderer = self.session.renderer();
        let mut reported = 0;

        let flow = loop {
            if self.is_cancelled() {
                break Flow::Cancelled;
            }
            let now = Instant::now();
            let tick = match deadline {
                Some(deadline) if now >= deadline => break Flow::Continue,
                Some(deadline) => (deadline - now).min(self.poll_interval),
                None => self.poll_interval,
            };
            tokio::time::sleep(tick).await;

            let elapsed = started.elapsed().as_secs();
            if elapsed != reported {
                reported = elapsed;
                renderer.on_step_progress(path, Some(elapsed));
            }
        };
        if reported > 0 {
            renderer.on_step_progress(path, None);
        }
        flow
    }
}

/// Handle on a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancelToken,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Raise the cancellation flag.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The run's cancellation flag.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// True once the task returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Outcome, if the task already returned.
    pub fn try_outcome(&mut self) -> Option<RunOutcome> {
        if !self.task.is_finished() {
            return None;
        }
        (&mut self.task).now_or_never().map(into_outcome)
    }

    /// Wait for the task to return.
    ///
    /// Cancel-safe: dropping the future leaves the task attached to the
    /// handle, so it can be waited on again.
    pub async fn wait(&mut self) -> RunOutcome {
        into_outcome((&mut self.task).await)
    }
}

fn into_outcome(result: Result<RunOutcome, tokio::task::JoinError>) -> RunOutcome {
    result.unwrap_or_else(|err| {
        RunOutcome::Error(format!("The protocol run stopped unexpectedly: {err}"))
    })
}

/// Spawn a run. `guard` holds the session's run slot until the task returns.
pub fn start(session: DeviceSession, guard: RunGuard, routine: Arc<ValidatedRoutine>) -> RunHandle {
    let cancel = CancelToken::new();
    let exec = ExecutionContext::new(session, cancel.clone());

    let task = tokio::spawn(async move {
        let _guard = guard;
        info!("protocol run started");
        let outcome = match routine.execute(&exec).await {
            Ok(Flow::Continue) => RunOutcome::Completed,
            Ok(Flow::Cancelled) => RunOutcome::Cancelled,
            Err(err) => report_failure(&exec, err),
        };
        info!(?outcome, "protocol run finished");
        outcome
    });

    RunHandle { cancel, task }
}

fn report_failure(exec: &ExecutionContext, err: KataraError) -> RunOutcome {
    let notifier = exec.session().notifier();
    let message = match &err {
        KataraError::Validation { path, message } => {
            notifier.report_validation_error(path, message);
            err.to_string()
        }
        _ if err.is_fatal_connection() => {
            notifier.report_fatal_error(CONNECTION_LOST);
            CONNECTION_LOST.to_string()
        }
        _ => {
            let message = err.to_string();
            notifier.report_fatal_error(&message);
            message
        }
    };
    error!(error = %err, "protocol run aborted");
    RunOutcome::Error(message)
}
