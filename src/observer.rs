//! Collaborators the engine reports to.
//!
//! The engine never draws anything. It tells a [`Renderer`] which node is
//! running and which pins changed, and tells a [`Notifier`] about errors and
//! warnings. The binary uses the tracing-backed implementations below; tests
//! use [`RecordingObserver`].

use crate::protocol::NodePath;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Visual state of a step or loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    /// Not running
    Idle,
    /// Currently executing
    Running,
    /// Failed validation
    Invalid,
}

/// Reflects engine progress.
pub trait Renderer: Send + Sync {
    /// A node changed state.
    fn on_step_state_changed(&self, path: &NodePath, state: StepState);

    /// A valve was driven (or is believed to have changed).
    fn on_pin_state_changed(&self, pin: u8, energized: bool);

    /// A loop started an iteration; `None` once the loop is done.
    fn on_iteration_progress(&self, path: &NodePath, iteration: Option<u32>);

    /// A pump's valves started or stopped cycling.
    fn on_pump_state_changed(&self, valves: [u8; 3], running: bool) {
        let _ = (valves, running);
    }

    /// Whole seconds spent in the current step so far; `None` clears it.
    fn on_step_progress(&self, path: &NodePath, elapsed_secs: Option<u64>) {
        let _ = (path, elapsed_secs);
    }
}

/// Surfaces problems to the operator.
pub trait Notifier: Send + Sync {
    /// Validation failed at `path`; blocks the run or save.
    fn report_validation_error(&self, path: &NodePath, message: &str);

    /// Something went wrong but was recovered from.
    fn report_warning(&self, message: &str);

    /// Something went wrong and the run was aborted.
    fn report_fatal_error(&self, message: &str);
}

/// Renderer that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRenderer;

impl Renderer for TracingRenderer {
    fn on_step_state_changed(&self, path: &NodePath, state: StepState) {
        debug!(step = %path, ?state, "step state");
    }

    fn on_pin_state_changed(&self, pin: u8, energized: bool) {
        debug!(pin, energized, "pin state");
    }

    fn on_iteration_progress(&self, path: &NodePath, iteration: Option<u32>) {
        match iteration {
            Some(iteration) => info!(step = %path, iteration, "loop iteration"),
            None => debug!(step = %path, "loop finished"),
        }
    }

    fn on_pump_state_changed(&self, valves: [u8; 3], running: bool) {
        info!(?valves, running, "pump state");
    }
}

/// Notifier that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn report_validation_error(&self, path: &NodePath, message: &str) {
        error!(step = %path, "{message}");
    }

    fn report_warning(&self, message: &str) {
        warn!("{message}");
    }

    fn report_fatal_error(&self, message: &str) {
        error!("{message}");
    }
}

/// Everything a [`RecordingObserver`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    /// `on_step_state_changed`
    StepState(NodePath, StepState),
    /// `on_pin_state_changed`
    Pin(u8, bool),
    /// `on_iteration_progress`
    Iteration(NodePath, Option<u32>),
    /// `on_pump_state_changed`
    Pump([u8; 3], bool),
    /// `report_validation_error`
    ValidationError(NodePath, String),
    /// `report_warning`
    Warning(String),
    /// `report_fatal_error`
    Fatal(String),
}

/// Renderer and notifier that keeps every callback for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ObservedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: ObservedEvent) {
        self.lock().push(event);
    }

    /// Snapshot of all events.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.lock().clone()
    }

    /// Warnings reported so far.
    pub fn warnings(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Warning(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fatal errors reported so far.
    pub fn fatal_errors(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Fatal(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Validation errors reported so far.
    pub fn validation_errors(&self) -> Vec<(NodePath, String)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::ValidationError(p, m) => Some((p.clone(), m.clone())),
                _ => None,
            })
            .collect()
    }

    /// How often `path` entered the running state.
    pub fn times_started(&self, path: &NodePath) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::StepState(p, StepState::Running) if p == path))
            .count()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Renderer for RecordingObserver {
    fn on_step_state_changed(&self, path: &NodePath, state: StepState) {
        self.push(ObservedEvent::StepState(path.clone(), state));
    }

    fn on_pin_state_changed(&self, pin: u8, energized: bool) {
        self.push(ObservedEvent::Pin(pin, energized));
    }

    fn on_iteration_progress(&self, path: &NodePath, iteration: Option<u32>) {
        self.push(ObservedEvent::Iteration(path.clone(), iteration));
    }

    fn on_pump_state_changed(&self, valves: [u8; 3], running: bool) {
        self.push(ObservedEvent::Pump(valves, running));
    }
}

impl Notifier for RecordingObserver {
    fn report_validation_error(&self, path: &NodePath, message: &str) {
        self.push(ObservedEvent::ValidationError(path.clone(), message.to_string()));
    }

    fn report_warning(&self, message: &str) {
        self.push(ObservedEvent::Warning(message.to_string()));
    }

    fn report_fatal_error(&self, message: &str) {
        self.push(ObservedEvent::Fatal(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_recording_observer_filters() {
        let observer = RecordingObserver::new();
        let path = NodePath::root().child(0);
        observer.on_step_state_changed(&path, StepState::Running);
        observer.on_step_state_changed(&path, StepState::Idle);
        observer.report_warning("careful");
        observer.report_fatal_error("gone");

        assert_eq!(observer.times_started(&path), 1);
        assert_eq!(observer.warnings(), vec!["careful".to_string()]);
        assert_eq!(observer.fatal_errors(), vec!["gone".to_string()]);
        assert_eq!(observer.events().len(), 4);
    }

    #[traced_test]
    #[test]
    fn test_tracing_notifier_logs_warnings() {
        TracingNotifier.report_warning("connection was reset");
        assert!(logs_contain("connection was reset"));
    }
}
