//! Leaf actions of a routine: pause, set valves, run a pump.
//!
//! A [`Step`] holds the raw text of its fields exactly as entered. Validation
//! compiles every field into a [`Parameter`] and checks it, for every
//! iteration of the enclosing loops when any field is an expression. The
//! result is a [`ValidatedStep`] that the engine executes; expression fields
//! are re-evaluated at each invocation.

use crate::error::{AppResult, KataraError};
use crate::expression::for_each_iteration;
use crate::hardware::controller::PinRange;
use crate::hardware::pump::{check_rate_cycles, Pump, PumpDirection, PumpRun, INDEFINITE};
use crate::observer::StepState;
use crate::protocol::engine::{ExecutionContext, Flow};
use crate::protocol::parameter::Parameter;
use crate::protocol::routine::{NodePath, ValidationContext};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// The kinds of step a routine can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Wait for a number of seconds.
    Pause,
    /// Energize or de-energize a list of valves.
    SetValves,
    /// Run a peristaltic pump sequence.
    RunPump,
}

impl StepKind {
    /// Every kind, in menu order.
    pub const ALL: [StepKind; 3] = [StepKind::SetValves, StepKind::RunPump, StepKind::Pause];

    /// Tag used in saved files.
    pub fn tag(self) -> &'static str {
        match self {
            StepKind::Pause => "PauseStep",
            StepKind::SetValves => "ValveStep",
            StepKind::RunPump => "PumpStep",
        }
    }

    /// Kind for a saved-file tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        StepKind::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Human readable name.
    pub fn label(self) -> &'static str {
        match self {
            StepKind::Pause => "Pause",
            StepKind::SetValves => "Open/close valve",
            StepKind::RunPump => "Pump",
        }
    }

    /// Names of the fields, in storage order.
    pub fn field_names(self) -> &'static [&'static str] {
        match self {
            StepKind::Pause => &["Time (s)"],
            StepKind::SetValves => &["Valve", "State"],
            StepKind::RunPump => &[
                "Rate (cycles/s)",
                "Number of Cycles",
                "Valve 1",
                "Valve 2",
                "Valve 3",
            ],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An editable step: its kind and the raw text of each field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    kind: StepKind,
    fields: Vec<String>,
}

impl Step {
    /// Build a step from raw field text; the field count must match the kind.
    pub fn new(kind: StepKind, fields: Vec<String>) -> Result<Self, String> {
        let expected = kind.field_names().len();
        if fields.len() != expected {
            return Err(format!(
                "A {} step has {expected} entries but {} were given.",
                kind.tag(),
                fields.len()
            ));
        }
        Ok(Self { kind, fields })
    }

    /// Pause for `time` seconds (`inf` waits until cancelled).
    pub fn pause(time: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Pause,
            fields: vec![time.into()],
        }
    }

    /// Set comma separated `valves` to comma separated `states`.
    pub fn set_valves(valves: impl Into<String>, states: impl Into<String>) -> Self {
        Self {
            kind: StepKind::SetValves,
            fields: vec![valves.into(), states.into()],
        }
    }

    /// Run the pump made of `valves` at `rate` for `cycles`.
    pub fn run_pump(
        rate: impl Into<String>,
        cycles: impl Into<String>,
        valves: [&str; 3],
    ) -> Self {
        let mut fields = vec![rate.into(), cycles.into()];
        fields.extend(valves.iter().map(|v| v.to_string()));
        Self {
            kind: StepKind::RunPump,
            fields,
        }
    }

    /// Kind of step.
    pub fn kind(&self) -> StepKind {
        self.kind
    }

    /// Raw field text.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Replace the raw text of one field. Returns false for an unknown index.
    pub fn set_field(&mut self, index: usize, value: impl Into<String>) -> bool {
        match self.fields.get_mut(index) {
            Some(field) => {
                *field = value.into();
                true
            }
            None => false,
        }
    }

    /// Check every field for every iteration of the enclosing loops.
    pub fn validate(&self, ctx: &ValidationContext<'_>) -> AppResult<ValidatedStep> {
        let action = match self.kind {
            StepKind::Pause => self.validate_pause(ctx),
            StepKind::SetValves => self.validate_valves(ctx),
            StepKind::RunPump => self.validate_pump(ctx),
        }
        .map_err(|message| KataraError::invalid(&ctx.path, message))?;

        Ok(ValidatedStep {
            path: ctx.path.clone(),
            action,
        })
    }

    fn validate_pause(&self, ctx: &ValidationContext<'_>) -> Result<StepAction, String> {
        let raw = self.fields[0].trim();
        if is_indefinite(raw) {
            if !ctx.is_last {
                return Err("You can only pause indefinitely on the final step of a protocol."
                    .to_string());
            }
            return Ok(StepAction::Pause(PauseTime::Indefinite));
        }

        let time = Parameter::compile(raw, ctx.depth())?;
        for_each_iteration(iteration_counts(ctx, &[&time]), |it| {
            pause_duration(&time, it).map(|_| ())
        })
        .map_err(|failure| failure.to_string())?;
        Ok(StepAction::Pause(PauseTime::Seconds(time)))
    }

    fn validate_valves(&self, ctx: &ValidationContext<'_>) -> Result<StepAction, String> {
        let valves_raw = strip_spaces(&self.fields[0]);
        let states_raw = strip_spaces(&self.fields[1]);
        if valves_raw.is_empty() || states_raw.is_empty() {
            return Err("Entry unfilled in valve step.".to_string());
        }

        let valves: Vec<&str> = valves_raw.split(',').collect();
        let mut states: Vec<&str> = states_raw.split(',').collect();

        let mut seen = HashSet::new();
        if !valves.iter().all(|v| seen.insert(*v)) {
            return Err("There are duplicate pin entries.".to_string());
        }
        if states.len() != valves.len() {
            if states.len() == 1 {
                states = vec![states[0]; valves.len()];
            } else {
                return Err(
                    "The number of valves and states entered in Valve Step are different."
                        .to_string(),
                );
            }
        }

        let depth = ctx.depth();
        let entries = valves
            .iter()
            .zip(&states)
            .map(|(valve, state)| {
                Ok((
                    Parameter::compile(valve, depth)?,
                    Parameter::compile(state, depth)?,
                ))
            })
            .collect::<Result<Vec<_>, String>>()?;

        let params: Vec<&Parameter> = entries.iter().flat_map(|(v, s)| [v, s]).collect();
        for_each_iteration(iteration_counts(ctx, &params), |it| {
            resolve_pins(&entries, it, ctx.pins).map(|_| ())
        })
        .map_err(|failure| failure.to_string())?;
        Ok(StepAction::SetValves(entries))
    }

    fn validate_pump(&self, ctx: &ValidationContext<'_>) -> Result<StepAction, String> {
        let depth = ctx.depth();
        let compile = |index: usize| {
            Parameter::compile(&self.fields[index], depth)
                .map_err(|e| format!("{}: {e}", self.kind.field_names()[index]))
        };
        let rate = compile(0)?;
        let cycles = compile(1)?;
        let valves = [compile(2)?, compile(3)?, compile(4)?];
        let terminal = ctx.is_last;

        let params = [&rate, &cycles, &valves[0], &valves[1], &valves[2]];
        for_each_iteration(iteration_counts(ctx, &params), |it| {
            resolve_pump(&rate, &cycles, &valves, it, ctx.pins, terminal).map(|_| ())
        })
        .map_err(|failure| failure.to_string())?;
        Ok(StepAction::RunPump {
            rate,
            cycles,
            valves,
            terminal,
        })
    }
}

/// Pause length.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseTime {
    /// Until cancelled.
    Indefinite,
    /// A number of seconds.
    Seconds(Parameter),
}

/// Checked, compiled step action.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Wait.
    Pause(PauseTime),
    /// (valve, state) pairs.
    SetValves(Vec<(Parameter, Parameter)>),
    /// Pump sequence.
    RunPump {
        /// Cycles per second
        rate: Parameter,
        /// Number of cycles
        cycles: Parameter,
        /// The three valves
        valves: [Parameter; 3],
        /// Last executable unit of the protocol; may pump indefinitely.
        terminal: bool,
    },
}

/// A step that passed validation, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStep {
    path: NodePath,
    action: StepAction,
}

impl ValidatedStep {
    /// Location in the routine tree.
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Compiled action.
    pub fn action(&self) -> &StepAction {
        &self.action
    }

    /// Run the step for one invocation.
    pub async fn execute(&self, exec: &ExecutionContext, context: &[u32]) -> AppResult<Flow> {
        let renderer = exec.session().renderer();
        renderer.on_step_state_changed(&self.path, StepState::Running);
        let result = match &self.action {
            StepAction::Pause(time) => self.run_pause(exec, time, context).await,
            StepAction::SetValves(entries) => self.run_set_valves(exec, entries, context).await,
            StepAction::RunPump {
                rate,
                cycles,
                valves,
                terminal,
            } => {
                let pins = exec.session().pin_range();
                match resolve_pump(rate, cycles, valves, context, pins, *terminal) {
                    Ok((pump, run)) => self.run_pump(exec, pump, run).await,
                    Err(message) => Err(KataraError::invalid(&self.path, message)),
                }
            }
        };
        renderer.on_step_state_changed(&self.path, StepState::Idle);
        result
    }

    async fn run_pause(
        &self,
        exec: &ExecutionContext,
        time: &PauseTime,
        context: &[u32],
    ) -> AppResult<Flow> {
        let duration = match time {
            PauseTime::Indefinite => None,
            PauseTime::Seconds(seconds) => Some(
                pause_duration(seconds, context)
                    .map_err(|m| KataraError::invalid(&self.path, m))?,
            ),
        };
        debug!(step = %self.path, ?duration, "pause");
        Ok(exec.pause(&self.path, duration).await)
    }

    async fn run_set_valves(
        &self,
        exec: &ExecutionContext,
        entries: &[(Parameter, Parameter)],
        context: &[u32],
    ) -> AppResult<Flow> {
        let session = exec.session();
        let pins = resolve_pins(entries, context, session.pin_range())
            .map_err(|m| KataraError::invalid(&self.path, m))?;
        {
            let mut controller = session.lock().await?;
            let result = controller.set_pins(&pins).await;
            session.absorb_warning(result, ())?;
        }
        for (pin, state) in &pins {
            session.renderer().on_pin_state_changed(*pin, *state);
        }
        Ok(exec.pause(&self.path, Some(Duration::ZERO)).await)
    }

    async fn run_pump(&self, exec: &ExecutionContext, pump: Pump, run: PumpRun) -> AppResult<Flow> {
        let session = exec.session();
        {
            let mut controller = session.lock().await?;
            let result = controller
                .run_pump(pump, PumpDirection::Forward, run)
                .await;
            session.absorb_warning(result, ())?;
        }
        session.renderer().on_pump_state_changed(pump.valves(), true);

        let flow = exec.pause(&self.path, run.duration()).await;
        match flow {
            Flow::Cancelled => self.stop_pump(exec, pump).await,
            Flow::Continue => match session.lock().await {
                Ok(mut controller) => controller.finish_pump(pump),
                Err(err) => {
                    warn!(step = %self.path, %pump, error = %err, "could not record finished pump");
                }
            },
        }
        session.render_pump_stopped(pump);
        Ok(flow)
    }

    async fn stop_pump(&self, exec: &ExecutionContext, pump: Pump) {
        let session = exec.session();
        let result = match session.lock().await {
            Ok(mut controller) => controller.stop_pump().await,
            Err(err) => Err(err),
        };
        if let Err(err) = session.absorb_warning(result, ()) {
            warn!(step = %self.path, %pump, error = %err, "could not stop pump after cancel");
        }
    }
}

fn is_indefinite(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "inf" | "infinity" | "indefinite"
    )
}

fn strip_spaces(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Only iterate over loop counts when something depends on them.
fn iteration_counts<'a>(ctx: &ValidationContext<'a>, params: &[&Parameter]) -> &'a [u32] {
    if params.iter().any(|p| p.is_expression()) {
        ctx.loop_counts
    } else {
        &[]
    }
}

fn pause_duration(time: &Parameter, it: &[u32]) -> Result<Duration, String> {
    let value = time
        .resolve(it)
        .map_err(|e| format!("Pause time '{}' cannot be evaluated: {e}", time.raw()))?;
    let seconds = value.as_f64();
    if seconds < 0.0 {
        return Err(format!(
            "Invalid pause time: {value}; you cannot pause for a negative amount of time."
        ));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("Invalid pause time: {value} is too long."))
}

fn resolve_valve(param: &Parameter, it: &[u32], pins: PinRange) -> Result<u8, String> {
    let value = param
        .resolve(it)
        .map_err(|e| format!("Valve entry '{}' cannot be evaluated: {e}", param.raw()))?;
    value
        .as_integer()
        .and_then(|v| pins.checked(v))
        .ok_or_else(|| {
            if param.is_expression() {
                format!(
                    "Valve entry {} evaluates to {value}. Available valves are {pins}.",
                    param.raw()
                )
            } else {
                format!(
                    "{} is not an available valve. Available valves are {pins}.",
                    param.raw()
                )
            }
        })
}

fn resolve_state(param: &Parameter, it: &[u32]) -> Result<bool, String> {
    let value = param
        .resolve(it)
        .map_err(|e| format!("Valve state '{}' cannot be evaluated: {e}", param.raw()))?;
    match value.as_integer() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(format!(
            "Valve state {value} is not allowed. \
             The valve state must be either 1 (energized) or 0 (not energized)."
        )),
    }
}

fn resolve_pins(
    entries: &[(Parameter, Parameter)],
    it: &[u32],
    pins: PinRange,
) -> Result<Vec<(u8, bool)>, String> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(entries.len());
    for (valve, state) in entries {
        let pin = resolve_valve(valve, it, pins)?;
        if !seen.insert(pin) {
            return Err(format!("Valve {pin} is set more than once."));
        }
        resolved.push((pin, resolve_state(state, it)?));
    }
    Ok(resolved)
}

fn resolve_integer(param: &Parameter, it: &[u32], what: &str) -> Result<i64, String> {
    let value = param
        .resolve(it)
        .map_err(|e| format!("The {what} '{}' cannot be evaluated: {e}", param.raw()))?;
    value.as_integer().ok_or_else(|| {
        format!(
            "{value} is not a valid {what} for a pump step. It must be a whole number."
        )
    })
}

fn resolve_pump(
    rate: &Parameter,
    cycles: &Parameter,
    valves: &[Parameter; 3],
    it: &[u32],
    pins: PinRange,
    terminal: bool,
) -> Result<(Pump, PumpRun), String> {
    let mut resolved = [0u8; 3];
    for (slot, valve) in resolved.iter_mut().zip(valves) {
        *slot = resolve_valve(valve, it, pins)?;
    }
    let pump = Pump::new(resolved)?;

    let rate_value = resolve_integer(rate, it, "rate")?;
    let cycles_value = resolve_integer(cycles, it, "number of cycles")?;
    if cycles_value == INDEFINITE && cycles.is_expression() {
        return Err(format!(
            "You cannot pump indefinitely inside a loop. {} in pump step evaluates to -1.",
            cycles.raw()
        ));
    }
    let run = check_rate_cycles(rate_value, cycles_value, terminal)?;
    Ok((pump, run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::mock::MockLink;
    use crate::observer::RecordingObserver;
    use crate::protocol::engine::CancelToken;
    use crate::session::DeviceSession;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn top(is_last: bool) -> ValidationContext<'static> {
        ValidationContext {
            path: NodePath::root().child(0),
            loop_counts: &[],
            is_last,
            pins: PinRange::default(),
        }
    }

    fn nested(counts: &[u32]) -> ValidationContext<'_> {
        ValidationContext {
            path: NodePath::root().child(0).child(0),
            loop_counts: counts,
            is_last: false,
            pins: PinRange::default(),
        }
    }

    fn message(err: KataraError) -> String {
        match err {
            KataraError::Validation { message, .. } => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_kind_tags() {
        for kind in StepKind::ALL {
            assert_eq!(StepKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(StepKind::from_tag("Loop"), None);
    }

    #[test]
    fn test_new_checks_field_count() {
        assert!(Step::new(StepKind::RunPump, vec!["1".into(); 5]).is_ok());
        assert!(Step::new(StepKind::Pause, vec!["1".into(), "2".into()]).is_err());
    }

    #[test]
    fn test_pump_duplicate_valves() {
        let step = Step::run_pump("10", "5", ["4", "4", "7"]);
        let err = message(step.validate(&top(false)).unwrap_err());
        assert!(err.contains("duplicate"), "{err}");
    }

    #[test]
    fn test_pump_rate_out_of_range() {
        let step = Step::run_pump("1000", "5", ["4", "5", "7"]);
        let err = message(step.validate(&top(false)).unwrap_err());
        assert!(err.contains("not a valid rate"), "{err}");
    }

    #[test]
    fn test_pump_indefinite_only_when_last() {
        let step = Step::run_pump("10", "-1", ["4", "5", "7"]);
        assert!(step.validate(&top(false)).is_err());
        let validated = step.validate(&top(true)).unwrap();
        assert!(matches!(
            validated.action(),
            StepAction::RunPump { terminal: true, .. }
        ));
        // Nothing inside a loop is ever the last unit.
        assert!(step.validate(&nested(&[3])).is_err());
    }

    #[test]
    fn test_pump_expression_cycles_cannot_be_indefinite() {
        let step = Step::run_pump("10", "i[0] - 2", ["4", "5", "7"]);
        let err = message(step.validate(&nested(&[3])).unwrap_err());
        assert!(err.contains("indefinitely inside a loop"), "{err}");
        assert!(err.contains("i[0] = 1"), "{err}");
    }

    #[test]
    fn test_pump_expression_valves_checked_per_iteration() {
        let ok = Step::run_pump("10", "5", ["i[0] + 3", "i[0] + 4", "2"]);
        assert!(ok.validate(&nested(&[5])).is_ok());

        let collides = Step::run_pump("10", "5", ["i[0] + 1", "3", "9"]);
        let err = message(collides.validate(&nested(&[4])).unwrap_err());
        assert!(err.contains("i[0] = 2"), "{err}");
    }

    #[test]
    fn test_valves_duplicate_and_mismatch() {
        let dup = Step::set_valves("5, 5", "1");
        assert_eq!(
            message(dup.validate(&top(false)).unwrap_err()),
            "There are duplicate pin entries."
        );
        let mismatch = Step::set_valves("5,6,7", "1,0");
        assert!(message(mismatch.validate(&top(false)).unwrap_err()).contains("different"));
    }

    #[test]
    fn test_valves_single_state_broadcasts() {
        let step = Step::set_valves("5, 6, 7", " 1 ");
        let validated = step.validate(&top(false)).unwrap();
        match validated.action() {
            StepAction::SetValves(entries) => {
                assert_eq!(entries.len(), 3);
                assert!(entries.iter().all(|(_, s)| s.raw() == "1"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_valves_reject_bad_pins_and_states() {
        assert!(Step::set_valves("1", "1").validate(&top(false)).is_err());
        assert!(Step::set_valves("70", "1").validate(&top(false)).is_err());
        assert!(Step::set_valves("5", "2").validate(&top(false)).is_err());
        assert!(Step::set_valves("i[0]", "1").validate(&top(false)).is_err());
    }

    #[test]
    fn test_valve_expressions_in_loop() {
        let step = Step::set_valves("i[0] + 1, 20", "1, i[1] - 1");
        assert!(step.validate(&nested(&[10, 2])).is_ok());
        let err = message(step.validate(&nested(&[10, 3])).unwrap_err());
        assert!(err.contains("i[1] = 3"), "{err}");
    }

    #[test]
    fn test_pause_rules() {
        assert!(Step::pause("0").validate(&top(false)).is_ok());
        assert!(Step::pause("2.5").validate(&top(false)).is_ok());
        assert!(Step::pause("-1").validate(&top(false)).is_err());
        assert!(Step::pause("").validate(&top(false)).is_err());
        assert!(Step::pause("inf").validate(&top(false)).is_err());
        assert!(Step::pause("inf").validate(&top(true)).is_ok());
        assert!(Step::pause("5 - i[0]").validate(&nested(&[5])).is_ok());
        assert!(Step::pause("4 - i[0]").validate(&nested(&[5])).is_err());
    }

    #[test]
    fn test_literal_steps_skip_iteration_walk() {
        // A huge loop nest costs nothing when no field depends on it.
        let counts = [1_000_000, 1_000_000];
        assert!(Step::set_valves("5", "1").validate(&nested(&counts)).is_ok());
    }

    #[test]
    fn test_expression_in_huge_loop_nest_is_rejected() {
        let counts = [1_000_000, 1_000_000];
        let err = message(Step::pause("i[0]").validate(&nested(&counts)).unwrap_err());
        assert!(err.contains("too many to check"), "{err}");
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn test_finished_pump_after_disconnect_is_logged() {
        let observer = RecordingObserver::new();
        let mut settings = Settings::default();
        settings.device.reset_delay_ms = 0;
        let session = DeviceSession::new(
            settings,
            Arc::new(observer.clone()),
            Arc::new(observer.clone()),
        );
        session.connect(Box::new(MockLink::new())).await.unwrap();

        let step = Step::run_pump("10", "20", ["4", "5", "6"])
            .validate(&top(true))
            .unwrap();
        let exec = ExecutionContext::new(session.clone(), CancelToken::new());
        let unplug = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            session.disconnect().await;
        };
        let (flow, ()) = tokio::join!(step.execute(&exec, &[]), unplug);

        assert_eq!(flow.unwrap(), Flow::Continue);
        assert!(logs_contain("could not record finished pump"));
    }
}
