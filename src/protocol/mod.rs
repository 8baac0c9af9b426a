//! Protocols: a named routine tree plus its run state machine.
//!
//! ```text
//! Idle -> Validating -> Running -> Idle      (completed or cancelled)
//!                              \-> Errored   (runtime error, reported)
//! ```
//!
//! `Errored` is left on the next run, edit, save or load. Calling
//! [`Protocol::run`] while running requests cancellation instead of starting
//! anything.

pub mod codec;
pub mod engine;
pub mod panel;
pub mod parameter;
pub mod routine;
pub mod step;

pub use engine::{CancelToken, RunHandle, RunOutcome};
pub use panel::ProtocolPanel;
pub use routine::{Action, Loop, NodePath, ValidatedRoutine};
pub use step::{Step, StepKind};

use crate::error::{AppResult, KataraError};
use crate::observer::StepState;
use crate::session::{DeviceSession, PUMP_IN_PROGRESS, RUN_IN_PROGRESS};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const EMPTY_PROTOCOL: &str = "There are no steps in this protocol!";

/// Run state of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Editable, not running
    Idle,
    /// Checking the tree before a run
    Validating,
    /// An execution task is walking the tree
    Running,
    /// The last run aborted with an error
    Errored,
}

/// What a call to [`Protocol::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// A new run was spawned.
    Started,
    /// The protocol was already running; cancellation was requested.
    CancelRequested,
}

/// A named, editable routine tree.
#[derive(Debug)]
pub struct Protocol {
    name: String,
    actions: Vec<Action>,
    writable: bool,
    state: ProtocolState,
    validated: Option<Arc<ValidatedRoutine>>,
    invalid_path: Option<NodePath>,
    handle: Option<RunHandle>,
    last_outcome: Option<RunOutcome>,
}

impl Protocol {
    /// Empty, writable protocol.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_actions(name, Vec::new())
    }

    /// Writable protocol holding `actions`.
    pub fn with_actions(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            actions,
            writable: true,
            state: ProtocolState::Idle,
            validated: None,
            invalid_path: None,
            handle: None,
            last_outcome: None,
        }
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Top-level nodes.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// False for protocols that may only be run.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Allow or forbid edits.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// True while an execution task is active.
    pub fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// Outcome of the most recent finished run.
    pub fn last_outcome(&self) -> Option<&RunOutcome> {
        self.last_outcome.as_ref()
    }

    /// Tree from the most recent successful validation.
    pub fn validated(&self) -> Option<&Arc<ValidatedRoutine>> {
        self.validated.as_ref()
    }

    /// Check the whole tree, marking the first invalid node.
    ///
    /// A failure is reported to the session's notifier and the node is
    /// rendered invalid; a previous invalid mark is cleared first.
    pub fn validate(&mut self, session: &DeviceSession) -> AppResult<Arc<ValidatedRoutine>> {
        if let Some(path) = self.invalid_path.take() {
            session.renderer().on_step_state_changed(&path, StepState::Idle);
        }
        match ValidatedRoutine::validate(&self.actions, session.pin_range()) {
            Ok(routine) => {
                let routine = Arc::new(routine);
                self.validated = Some(Arc::clone(&routine));
                Ok(routine)
            }
            Err(err) => {
                self.validated = None;
                if let KataraError::Validation { path, message } = &err {
                    session.notifier().report_validation_error(path, message);
                    session
                        .renderer()
                        .on_step_state_changed(path, StepState::Invalid);
                    self.invalid_path = Some(path.clone());
                }
                Err(err)
            }
        }
    }

    /// Start a run, or request cancellation if one is active.
    ///
    /// Rejected without any state change when another protocol is running,
    /// no controller is connected, a pump is running or the tree is empty.
    pub async fn run(&mut self, session: &DeviceSession) -> AppResult<RunRequest> {
        self.poll();
        if self.state == ProtocolState::Running {
            self.cancel();
            info!(protocol = %self.name, "cancel requested");
            return Ok(RunRequest::CancelRequested);
        }
        self.settle();

        if session.is_protocol_running() {
            return Err(KataraError::Concurrency(RUN_IN_PROGRESS.to_string()));
        }
        if !session.is_connected().await {
            return Err(KataraError::NotConnected);
        }
        if session.pump_busy().await {
            return Err(KataraError::Concurrency(PUMP_IN_PROGRESS.to_string()));
        }
        if self.actions.is_empty() {
            return Err(KataraError::invalid(&NodePath::root(), EMPTY_PROTOCOL));
        }

        self.state = ProtocolState::Validating;
        let routine = match self.validate(session) {
            Ok(routine) => routine,
            Err(err) => {
                self.state = ProtocolState::Idle;
                return Err(err);
            }
        };
        // The checks above are repeated under the controller lock.
        let guard = match session.begin_run().await {
            Ok(guard) => guard,
            Err(err) => {
                self.state = ProtocolState::Idle;
                return Err(err);
            }
        };

        self.handle = Some(engine::start(session.clone(), guard, routine));
        self.state = ProtocolState::Running;
        self.last_outcome = None;
        info!(protocol = %self.name, "protocol started");
        Ok(RunRequest::Started)
    }

    /// Raise the cancellation flag of the active run, if any.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    /// Cancellation flag of the active run.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.handle.as_ref().map(|handle| handle.cancel_token().clone())
    }

    /// Collect the outcome of a finished run without waiting.
    pub fn poll(&mut self) -> Option<RunOutcome> {
        let outcome = self.handle.as_mut()?.try_outcome()?;
        self.handle = None;
        self.finish(outcome.clone());
        Some(outcome)
    }

    /// Wait for the active run to end.
    ///
    /// Cancel-safe: if the future is dropped the run stays attached and a
    /// later `wait` picks it up.
    pub async fn wait(&mut self) -> Option<RunOutcome> {
        let outcome = self.handle.as_mut()?.wait().await;
        self.handle = None;
        self.finish(outcome.clone());
        Some(outcome)
    }

    /// Wait for the active run, cancelling it if `interrupt` resolves first.
    ///
    /// A cancelled run is still awaited, so its cleanup (such as stopping a
    /// pump) has reached the device by the time this returns.
    pub async fn wait_or_cancel(
        &mut self,
        interrupt: impl Future<Output = ()>,
    ) -> Option<RunOutcome> {
        tokio::select! {
            outcome = self.wait() => return outcome,
            () = interrupt => {}
        }
        info!(protocol = %self.name, "interrupted, cancelling run");
        self.cancel();
        self.wait().await
    }

    fn finish(&mut self, outcome: RunOutcome) {
        self.state = match outcome {
            RunOutcome::Error(_) => ProtocolState::Errored,
            RunOutcome::Completed | RunOutcome::Cancelled => ProtocolState::Idle,
        };
        debug!(protocol = %self.name, ?outcome, "run collected");
        self.last_outcome = Some(outcome);
    }

    fn settle(&mut self) {
        if self.state == ProtocolState::Errored {
            self.state = ProtocolState::Idle;
        }
    }

    fn ensure_idle(&mut self, action: &str) -> AppResult<()> {
        self.poll();
        if self.is_running() {
            return Err(KataraError::Concurrency(format!(
                "You cannot {action} a protocol while it is running."
            )));
        }
        self.settle();
        Ok(())
    }

    /// Apply an edit to the tree.
    ///
    /// Rejected while running and for read-only protocols. Any previous
    /// validation is discarded.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut Vec<Action>) -> R) -> AppResult<R> {
        self.ensure_idle("edit")?;
        if !self.writable {
            return Err(KataraError::invalid(
                &NodePath::root(),
                format!("The protocol '{}' cannot be edited.", self.name),
            ));
        }
        self.validated = None;
        Ok(f(&mut self.actions))
    }

    /// Append a node.
    pub fn push(&mut self, action: impl Into<Action>) -> AppResult<()> {
        let action = action.into();
        self.edit(|actions| actions.push(action))
    }

    /// Insert a node at `index` (clamped to the end).
    pub fn insert(&mut self, index: usize, action: impl Into<Action>) -> AppResult<()> {
        let action = action.into();
        self.edit(|actions| {
            let index = index.min(actions.len());
            actions.insert(index, action);
        })
    }

    /// Remove and return the node at `index`.
    pub fn remove(&mut self, index: usize) -> AppResult<Option<Action>> {
        self.edit(|actions| (index < actions.len()).then(|| actions.remove(index)))
    }

    /// Replace the node at `index`, returning the old one.
    pub fn replace(&mut self, index: usize, action: impl Into<Action>) -> AppResult<Option<Action>> {
        let action = action.into();
        self.edit(|actions| {
            actions
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, action))
        })
    }

    /// Validate and encode the tree. Only allowed while idle.
    pub fn save(&mut self, session: &DeviceSession) -> AppResult<Value> {
        self.ensure_idle("save")?;
        if self.actions.is_empty() {
            return Err(KataraError::invalid(&NodePath::root(), EMPTY_PROTOCOL));
        }
        self.validate(session)?;
        Ok(codec::encode_protocol(&self.actions))
    }

    /// Replace the tree with a decoded one. Only allowed while idle.
    pub fn load(&mut self, value: &Value) -> AppResult<()> {
        let actions = codec::decode_protocol(value)?;
        self.edit(|current| *current = actions)
    }

    /// Save as pretty-printed JSON.
    pub fn save_to_path(&mut self, session: &DeviceSession, path: &Path) -> AppResult<()> {
        let value = self.save(session)?;
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
        info!(protocol = %self.name, path = %path.display(), "protocol saved");
        Ok(())
    }

    /// Read a saved protocol, named after the file stem.
    pub fn load_from_path(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let actions = codec::decode_protocol(&value)?;
        Ok(Self::with_actions(file_stem(path), actions))
    }
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "protocol".to_string())
}
