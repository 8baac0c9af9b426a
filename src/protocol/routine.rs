//! The routine tree: steps and loops, validated and executed recursively.
//!
//! Editing happens on [`Action`]; a successful validation pass produces a
//! parallel [`ValidatedAction`] tree that the engine walks. Loops thread the
//! iteration context downward with the innermost iteration at index 0.

use crate::error::{AppResult, KataraError};
use crate::hardware::controller::PinRange;
use crate::observer::StepState;
use crate::protocol::engine::{ExecutionContext, Flow};
use crate::protocol::step::{Step, StepKind, ValidatedStep};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::fmt::Write as _;

/// Position of a node in the tree, outermost index first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<usize>);

impl NodePath {
    /// The protocol itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of the `index`-th child of this node.
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// Zero-based indices from the root.
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Number of enclosing sequences (0 for the root).
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("protocol");
        }
        f.write_str("step ")?;
        for (n, index) in self.0.iter().enumerate() {
            if n > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", index + 1)?;
        }
        Ok(())
    }
}

/// What a step is checked against.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    /// Node being validated
    pub path: NodePath,
    /// Iteration counts of the enclosing loops, innermost first
    pub loop_counts: &'a [u32],
    /// Last executable unit of the whole protocol
    pub is_last: bool,
    /// Addressable pins
    pub pins: PinRange,
}

impl ValidationContext<'_> {
    /// Number of enclosing loops.
    pub fn depth(&self) -> usize {
        self.loop_counts.len()
    }
}

/// A node of the editable tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Leaf
    Step(Step),
    /// Repeated sub-sequence
    Loop(Loop),
}

impl From<Step> for Action {
    fn from(step: Step) -> Self {
        Action::Step(step)
    }
}

impl From<Loop> for Action {
    fn from(lp: Loop) -> Self {
        Action::Loop(lp)
    }
}

impl Action {
    /// Short name used in listings.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Step(step) => step.kind().label(),
            Action::Loop(_) => "Loop",
        }
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        match self {
            Action::Step(_) => 1,
            Action::Loop(lp) => 1 + lp.children.iter().map(Action::node_count).sum::<usize>(),
        }
    }
}

/// Repeat a child sequence a fixed number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    iterations: String,
    step_kinds: Vec<StepKind>,
    children: Vec<Action>,
}

impl Loop {
    /// Empty loop that accepts every step kind.
    pub fn new(iterations: impl Into<String>) -> Self {
        Self {
            iterations: iterations.into(),
            step_kinds: StepKind::ALL.to_vec(),
            children: Vec::new(),
        }
    }

    /// Restrict which step kinds may be placed directly in this loop.
    pub fn with_step_kinds(mut self, kinds: Vec<StepKind>) -> Self {
        self.step_kinds = kinds;
        self
    }

    /// Append children.
    pub fn with_children(mut self, children: Vec<Action>) -> Self {
        self.children.extend(children);
        self
    }

    /// Raw iteration count text.
    pub fn iterations(&self) -> &str {
        &self.iterations
    }

    /// Replace the iteration count text.
    pub fn set_iterations(&mut self, iterations: impl Into<String>) {
        self.iterations = iterations.into();
    }

    /// Step kinds allowed in this loop.
    pub fn step_kinds(&self) -> &[StepKind] {
        &self.step_kinds
    }

    /// True if `action` may be placed directly in this loop.
    pub fn allows(&self, action: &Action) -> bool {
        match action {
            Action::Step(step) => self.step_kinds.contains(&step.kind()),
            Action::Loop(_) => true,
        }
    }

    /// Children in order.
    pub fn children(&self) -> &[Action] {
        &self.children
    }

    /// Mutable children.
    pub fn children_mut(&mut self) -> &mut Vec<Action> {
        &mut self.children
    }

    fn validate(
        &self,
        path: NodePath,
        outer: &[u32],
        pins: PinRange,
    ) -> AppResult<ValidatedLoop> {
        let raw = self.iterations.trim();
        if raw.is_empty() {
            return Err(KataraError::invalid(
                &path,
                "Error: Unfilled number of iterations in loop.",
            ));
        }
        let count: i64 = raw
            .parse()
            .map_err(|_| KataraError::invalid(&path, format!("{raw} is not a valid n")))?;
        if count < 1 {
            return Err(KataraError::invalid(
                &path,
                "You must loop over a positive integer number of iterations.",
            ));
        }
        let count = u32::try_from(count)
            .map_err(|_| KataraError::invalid(&path, format!("{raw} is not a valid n")))?;
        if self.children.is_empty() {
            return Err(KataraError::invalid(
                &path,
                "You cannot run a loop with no steps!",
            ));
        }
        for (index, child) in self.children.iter().enumerate() {
            if !self.allows(child) {
                return Err(KataraError::invalid(
                    &path.child(index),
                    format!("A {} step cannot be used in this loop.", child.label()),
                ));
            }
        }

        let mut counts = Vec::with_capacity(outer.len() + 1);
        counts.push(count);
        counts.extend_from_slice(outer);
        let children = validate_sequence(&self.children, &path, &counts, false, pins)?;
        Ok(ValidatedLoop {
            path,
            iterations: count,
            children,
        })
    }
}

/// Validate a sequence of siblings below `parent`.
///
/// Stops at the first invalid node. Only the last node of the top-level
/// sequence counts as the protocol's final unit.
pub fn validate_sequence(
    actions: &[Action],
    parent: &NodePath,
    loop_counts: &[u32],
    top_level: bool,
    pins: PinRange,
) -> AppResult<Vec<ValidatedAction>> {
    actions
        .iter()
        .enumerate()
        .map(|(index, action)| {
            let path = parent.child(index);
            match action {
                Action::Step(step) => {
                    let ctx = ValidationContext {
                        path,
                        loop_counts,
                        is_last: top_level && index + 1 == actions.len(),
                        pins,
                    };
                    step.validate(&ctx).map(ValidatedAction::Step)
                }
                Action::Loop(lp) => lp.validate(path, loop_counts, pins).map(ValidatedAction::Loop),
            }
        })
        .collect()
}

/// A validated node.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedAction {
    /// Leaf
    Step(ValidatedStep),
    /// Loop
    Loop(ValidatedLoop),
}

impl ValidatedAction {
    /// Location in the tree.
    pub fn path(&self) -> &NodePath {
        match self {
            ValidatedAction::Step(step) => step.path(),
            ValidatedAction::Loop(lp) => &lp.path,
        }
    }

    async fn execute(&self, exec: &ExecutionContext, context: &[u32]) -> AppResult<Flow> {
        match self {
            ValidatedAction::Step(step) => step.execute(exec, context).await,
            ValidatedAction::Loop(lp) => lp.execute(exec, context).await,
        }
    }
}

/// A loop that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedLoop {
    path: NodePath,
    iterations: u32,
    children: Vec<ValidatedAction>,
}

impl ValidatedLoop {
    /// Checked iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Validated children.
    pub fn children(&self) -> &[ValidatedAction] {
        &self.children
    }

    async fn execute(&self, exec: &ExecutionContext, context: &[u32]) -> AppResult<Flow> {
        let renderer = exec.session().renderer();
        renderer.on_step_state_changed(&self.path, StepState::Running);

        let mut inner = Vec::with_capacity(context.len() + 1);
        inner.push(0);
        inner.extend_from_slice(context);

        let mut result = Ok(Flow::Continue);
        for iteration in 1..=self.iterations {
            inner[0] = iteration;
            renderer.on_iteration_progress(&self.path, Some(iteration));
            result = execute_sequence(&self.children, exec, &inner).await;
            if !matches!(result, Ok(Flow::Continue)) {
                break;
            }
        }

        renderer.on_iteration_progress(&self.path, None);
        renderer.on_step_state_changed(&self.path, StepState::Idle);
        result
    }
}

/// Run siblings in order, checking for cancellation around each one.
pub fn execute_sequence<'a>(
    actions: &'a [ValidatedAction],
    exec: &'a ExecutionContext,
    context: &'a [u32],
) -> BoxFuture<'a, AppResult<Flow>> {
    async move {
        for action in actions {
            if exec.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            if action.execute(exec, context).await? == Flow::Cancelled {
                return Ok(Flow::Cancelled);
            }
        }
        if exec.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        Ok(Flow::Continue)
    }
    .boxed()
}

/// A whole validated tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRoutine {
    actions: Vec<ValidatedAction>,
}

impl ValidatedRoutine {
    /// Validate a top-level sequence.
    pub fn validate(actions: &[Action], pins: PinRange) -> AppResult<Self> {
        let actions = validate_sequence(actions, &NodePath::root(), &[], true, pins)?;
        Ok(Self { actions })
    }

    /// Top-level nodes.
    pub fn actions(&self) -> &[ValidatedAction] {
        &self.actions
    }

    /// Walk the tree once.
    pub async fn execute(&self, exec: &ExecutionContext) -> AppResult<Flow> {
        execute_sequence(&self.actions, exec, &[]).await
    }
}

/// Indented listing of a tree, one node per line.
pub fn render_tree(actions: &[Action]) -> String {
    let mut out = String::new();
    render_into(&mut out, actions, &NodePath::root());
    out
}

fn render_into(out: &mut String, actions: &[Action], parent: &NodePath) {
    for (index, action) in actions.iter().enumerate() {
        let path = parent.child(index);
        let indent = "  ".repeat(parent.depth());
        // Writing to a String cannot fail.
        let _ = match action {
            Action::Step(step) => writeln!(
                out,
                "{indent}{path}: {} [{}]",
                step.kind().label(),
                step.fields().join(", ")
            ),
            Action::Loop(lp) => writeln!(
                out,
                "{indent}{path}: Loop x {}",
                lp.iterations().trim()
            ),
        };
        if let Action::Loop(lp) = action {
            render_into(out, lp.children(), &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(err: KataraError) -> (NodePath, String) {
        match err {
            KataraError::Validation { path, message } => (path, message),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_node_path_display() {
        assert_eq!(NodePath::root().to_string(), "protocol");
        assert_eq!(NodePath::root().child(0).child(2).to_string(), "step 1.3");
    }

    #[test]
    fn test_loop_iteration_messages() {
        let pins = PinRange::default();
        let cases = [
            ("", "Error: Unfilled number of iterations in loop."),
            ("abc", "abc is not a valid n"),
            ("0", "You must loop over a positive integer number of iterations."),
        ];
        for (raw, expected) in cases {
            let lp = Loop::new(raw).with_children(vec![Step::pause("1").into()]);
            let err = ValidatedRoutine::validate(&[lp.into()], pins).unwrap_err();
            assert_eq!(message(err).1, expected);
        }

        let empty = Loop::new("3");
        let err = ValidatedRoutine::validate(&[empty.into()], pins).unwrap_err();
        assert_eq!(message(err).1, "You cannot run a loop with no steps!");
    }

    #[test]
    fn test_first_invalid_node_is_reported() {
        let tree: Vec<Action> = vec![
            Step::set_valves("5", "1").into(),
            Loop::new("2")
                .with_children(vec![
                    Step::pause("1").into(),
                    Step::set_valves("5", "7").into(),
                    Step::set_valves("4", "9").into(),
                ])
                .into(),
        ];
        let err = ValidatedRoutine::validate(&tree, PinRange::default()).unwrap_err();
        let (path, _) = message(err);
        assert_eq!(path, NodePath::root().child(1).child(1));
    }

    #[test]
    fn test_nested_expression_sees_outer_counts() {
        let tree: Vec<Action> = vec![Loop::new("3")
            .with_children(vec![Loop::new("4")
                .with_children(vec![Step::set_valves("i[0] + i[1]", "1").into()])
                .into()])
            .into()];
        assert!(ValidatedRoutine::validate(&tree, PinRange::default()).is_ok());

        let too_deep: Vec<Action> = vec![Loop::new("3")
            .with_children(vec![Step::set_valves("i[1]", "1").into()])
            .into()];
        assert!(ValidatedRoutine::validate(&too_deep, PinRange::default()).is_err());
    }

    #[test]
    fn test_step_kind_allow_list() {
        let lp = Loop::new("2")
            .with_step_kinds(vec![StepKind::Pause])
            .with_children(vec![Step::set_valves("5", "1").into()]);
        let err = ValidatedRoutine::validate(&[lp.into()], PinRange::default()).unwrap_err();
        assert!(message(err).1.contains("cannot be used in this loop"));
    }

    #[test]
    fn test_only_top_level_last_is_terminal() {
        let last_in_loop: Vec<Action> = vec![Loop::new("1")
            .with_children(vec![Step::run_pump("10", "-1", ["4", "5", "6"]).into()])
            .into()];
        assert!(ValidatedRoutine::validate(&last_in_loop, PinRange::default()).is_err());

        let last: Vec<Action> = vec![
            Step::pause("1").into(),
            Step::run_pump("10", "-1", ["4", "5", "6"]).into(),
        ];
        assert!(ValidatedRoutine::validate(&last, PinRange::default()).is_ok());
    }

    #[test]
    fn test_render_tree() {
        let tree: Vec<Action> = vec![
            Step::pause("2").into(),
            Loop::new("3")
                .with_children(vec![Step::set_valves("5,6", "1").into()])
                .into(),
        ];
        let listing = render_tree(&tree);
        assert!(listing.contains("step 1: Pause [2]"));
        assert!(listing.contains("step 2: Loop x 3"));
        assert!(listing.contains("  step 2.1: Open/close valve [5,6, 1]"));
        assert_eq!(tree[1].node_count(), 2);
    }
}
