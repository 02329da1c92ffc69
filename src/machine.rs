//! The FSM specification algebra and its execution runtime.
//!
//! An [`FsmSpec`] is a pure value: named states, declared valid
//! transitions, per-state entry/exit hook chains, and per-state event
//! handlers. [`FsmSpec::merge`] combines several specifications for the
//! same abstract machine, which is how the combinators graft behavior
//! onto a wrapped specification without clobbering it.
//!
//! A [`Machine`] is a materialized instance. Every machine serializes
//! event dispatch, hook execution, and state-data mutation under one
//! transition lock; events fired by hooks drain in the same lock
//! acquisition, so a transition and its follow-ups are atomic with
//! respect to external events. Distinct machines (including parent and
//! child) run concurrently on the pools.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::FailReason;
use crate::operation::CompletionSlot;
use crate::pools::Pools;
use crate::state::{Frame, HistoryEntry, OpSnapshot, StateData, TimeoutId};
use crate::value::{Env, Value};

/// The closed state vocabulary of the engine.
///
/// Every composed machine admits the terminal states `Completed`,
/// `Failed`, and `Aborted`; `TimedOut` is additionally admitted where a
/// timeout wrapper is active. The remaining states belong to the
/// combinators' controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Initial state of every specification.
    Init,
    /// Work is in flight.
    Running,
    /// A parallel saw its last child terminate.
    OpsComplete,
    /// A sequence captured a step's result.
    StepCompleted,
    /// A sequence saw a step fail.
    StepFailed,
    /// Terminal: the operation produced its result.
    Completed,
    /// Terminal: the operation failed.
    Failed,
    /// Terminal: the operation was externally aborted.
    Aborted,
    /// Terminal: a timeout wrapper gave up on the operation.
    TimedOut,
}

impl State {
    /// True for the four terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Completed | State::Failed | State::Aborted | State::TimedOut
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "init",
            State::Running => "running",
            State::OpsComplete => "ops-complete",
            State::StepCompleted => "step-completed",
            State::StepFailed => "step-failed",
            State::Completed => "completed",
            State::Failed => "failed",
            State::Aborted => "aborted",
            State::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Feature flags a specification may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Serialize transitions within one machine instance. Always honored
    /// by this runtime; the flag participates in merge and reporting.
    LockTransition,
    /// Record a sanitized snapshot of each exited state.
    History,
}

/// Events dispatched into a running machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// Synthetic kick-off delivered by `operate` and by parent machines.
    Start,
    /// Cooperative cancellation request, with an optional reason.
    Abort(Option<Value>),
    /// A parallel child completed.
    OpComplete(OpSnapshot),
    /// A parallel child failed or aborted.
    OpFail(OpSnapshot),
    /// A sequence step completed with a result.
    StepComplete(Value),
    /// A sequence step failed.
    StepFail(FailReason),
    /// A sequence step was aborted.
    StepAbort(FailReason),
    /// Internal: the sequence controller should dispatch its next step.
    RunNextStep,
    /// Internal: finish the compound successfully.
    Complete,
    /// Internal: finish the compound with the recorded fail reason.
    Fail,
}

impl Event {
    /// The handler-table key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start => EventKind::Start,
            Event::Abort(_) => EventKind::Abort,
            Event::OpComplete(_) => EventKind::OpComplete,
            Event::OpFail(_) => EventKind::OpFail,
            Event::StepComplete(_) => EventKind::StepComplete,
            Event::StepFail(_) => EventKind::StepFail,
            Event::StepAbort(_) => EventKind::StepAbort,
            Event::RunNextStep => EventKind::RunNextStep,
            Event::Complete => EventKind::Complete,
            Event::Fail => EventKind::Fail,
        }
    }
}

/// Discriminant of [`Event`], used to key per-state handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    Start,
    Abort,
    OpComplete,
    OpFail,
    StepComplete,
    StepFail,
    StepAbort,
    RunNextStep,
    Complete,
    Fail,
}

/// What a hook or handler asks the machine to do next.
#[derive(Debug)]
pub enum Flow {
    /// Nothing further; the next hook in a guarded chain may run.
    Handled,
    /// Transition to the given state. Stops a guarded chain.
    Transition(State),
    /// Deliver this event to the same machine once the current
    /// transition settles. Stops a guarded chain.
    Fire(Event),
}

/// A per-state entry or exit hook.
///
/// Hooks run under the machine's transition lock and must not call
/// [`Machine::send`] inline; follow-up work is expressed through the
/// returned [`Flow`] or handed to [`Pools::execute`].
pub type Hook = Arc<dyn Fn(&Machine, &mut StateData) -> Flow + Send + Sync>;

/// A per-state event handler. Same locking contract as [`Hook`].
pub type Handler = Arc<dyn Fn(&Machine, &mut StateData, &Event) -> Flow + Send + Sync>;

/// Declarations for one named state.
#[derive(Clone, Default)]
pub(crate) struct StateSpec {
    pub(crate) transitions: HashSet<State>,
    pub(crate) on_enter: Vec<Hook>,
    pub(crate) on_exit: Vec<Hook>,
    pub(crate) handlers: HashMap<EventKind, Handler>,
}

/// A pure, freely shareable FSM specification.
///
/// Build one with [`SpecBuilder`](crate::SpecBuilder) or the combinator
/// constructors; combine with [`FsmSpec::merge`].
#[derive(Clone, Default)]
pub struct FsmSpec {
    pub(crate) name: Option<String>,
    pub(crate) initial: Option<State>,
    pub(crate) states: HashMap<State, StateSpec>,
    pub(crate) features: Vec<Feature>,
}

impl FsmSpec {
    /// Merge several specifications for the same abstract machine.
    ///
    /// Transitions are unioned; features concatenated and de-duplicated;
    /// entry/exit hooks form a guarded chain in declaration order (the
    /// first hook that transitions or fires stops the chain); event
    /// handlers are last-writer-wins per (state, event); name and
    /// initial state are first-non-null-wins.
    pub fn merge(specs: impl IntoIterator<Item = FsmSpec>) -> FsmSpec {
        let mut merged = FsmSpec::default();
        for spec in specs {
            if merged.name.is_none() {
                merged.name = spec.name;
            }
            if merged.initial.is_none() {
                merged.initial = spec.initial;
            }
            for feature in spec.features {
                if !merged.features.contains(&feature) {
                    merged.features.push(feature);
                }
            }
            for (state, incoming) in spec.states {
                let slot = merged.states.entry(state).or_default();
                slot.transitions.extend(incoming.transitions);
                slot.on_enter.extend(incoming.on_enter);
                slot.on_exit.extend(incoming.on_exit);
                for (kind, handler) in incoming.handlers {
                    slot.handlers.insert(kind, handler);
                }
            }
        }
        merged
    }

    /// The specification's name, if one was declared.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True when the feature was declared by any merged input.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// All states this specification declares.
    pub fn declared_states(&self) -> Vec<State> {
        self.states.keys().copied().collect()
    }

    pub(crate) fn handler(&self, state: State, kind: EventKind) -> Option<&Handler> {
        self.states.get(&state)?.handlers.get(&kind)
    }

    pub(crate) fn on_enter(&self, state: State) -> &[Hook] {
        self.states
            .get(&state)
            .map(|s| s.on_enter.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn on_exit(&self, state: State) -> &[Hook] {
        self.states
            .get(&state)
            .map(|s| s.on_exit.as_slice())
            .unwrap_or(&[])
    }

    /// `Failed` and `Aborted` are admissible sinks from any non-terminal
    /// state; everything else must be declared.
    pub(crate) fn allows(&self, from: State, to: State) -> bool {
        if from.is_terminal() {
            return false;
        }
        if matches!(to, State::Failed | State::Aborted) {
            return true;
        }
        self.states
            .get(&from)
            .is_some_and(|s| s.transitions.contains(&to))
    }
}

/// Consistent snapshot of a machine, taken under its transition lock.
#[derive(Debug, Clone)]
pub struct OpStatus {
    /// The specification's name, if declared.
    pub name: Option<String>,
    /// Current state.
    pub state: State,
    /// Result so far.
    pub result: Value,
    /// Fail reason so far.
    pub fail_reason: Option<FailReason>,
    /// The top frame's env, for sequence controllers.
    pub env: Option<Env>,
    /// Step list of the top sequence frame.
    pub steps: Vec<StepStatus>,
    /// States of materialized child machines, in input order.
    pub children: Vec<ChildStatus>,
    /// Recorded history, oldest first.
    pub history: Vec<HistoryEntry>,
}

/// One step's place in a running sequence.
#[derive(Debug, Clone)]
pub struct StepStatus {
    /// Debug name of the step's source expression.
    pub op_sym: String,
    /// Names the step makes available.
    pub syms: Arc<[String]>,
    /// The step ran and its result was captured.
    pub done: bool,
    /// The step is currently in flight.
    pub current: bool,
}

/// A child machine's current state.
#[derive(Debug, Clone, Copy)]
pub struct ChildStatus {
    /// Position in the combinator's input order.
    pub index: usize,
    /// The child's current state.
    pub state: State,
}

struct MachineCore {
    current: State,
    data: StateData,
    queue: VecDeque<Event>,
}

/// A materialized FSM instance.
pub struct Machine {
    spec: FsmSpec,
    pools: Pools,
    self_ref: Weak<Machine>,
    inner: Mutex<MachineCore>,
}

impl Machine {
    /// Instantiate a specification. Entry hooks of the initial state run
    /// before this returns; the machine then waits for [`Event::Start`].
    pub(crate) fn materialize(
        spec: FsmSpec,
        pools: Pools,
        promise: Option<Arc<CompletionSlot>>,
    ) -> Arc<Machine> {
        let initial = spec.initial.unwrap_or(State::Init);
        let machine = Arc::new_cyclic(|self_ref| Machine {
            spec,
            pools,
            self_ref: self_ref.clone(),
            inner: Mutex::new(MachineCore {
                current: initial,
                data: StateData::new(promise),
                queue: VecDeque::new(),
            }),
        });
        let mut core = machine.inner.lock();
        if let Some(next) = machine.run_entry(&mut core, initial) {
            machine.transition(&mut core, next);
        }
        machine.pump(&mut core);
        drop(core);
        machine
    }

    /// Dispatch an event. Runs the handler, any resulting transition,
    /// and all internally fired follow-up events to completion under the
    /// transition lock before returning.
    pub fn send(&self, event: Event) {
        let mut core = self.inner.lock();
        self.deliver(&mut core, event);
        self.pump(&mut core);
    }

    /// A weak handle to this machine, for timers and child wiring that
    /// must not keep a finished operation alive.
    pub fn weak(&self) -> Weak<Machine> {
        self.self_ref.clone()
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.inner.lock().current
    }

    /// The machine's pools.
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// The specification's name, if declared.
    pub fn name(&self) -> Option<&str> {
        self.spec.name()
    }

    /// Snapshot of current state and state data.
    pub fn status(&self) -> OpStatus {
        let core = self.inner.lock();
        let mut env = None;
        let mut steps = Vec::new();
        let mut children = Vec::new();
        match core.data.op_stack.last() {
            Some(Frame::Sequence(frame)) => {
                env = Some(frame.env.clone());
                for (i, step) in frame.steps.iter().enumerate() {
                    let dispatched = i < frame.todo;
                    let current = dispatched && i + 1 == frame.todo && frame.result_fn.is_some();
                    steps.push(StepStatus {
                        op_sym: step.op_sym.clone(),
                        syms: step.syms.clone(),
                        done: dispatched && !current,
                        current,
                    });
                }
                children = child_states(&frame.machines);
            }
            Some(Frame::Parallel(frame)) => {
                children = child_states(&frame.machines);
            }
            None => {}
        }
        OpStatus {
            name: self.spec.name.clone(),
            state: core.current,
            result: core.data.result.clone(),
            fail_reason: core.data.fail_reason.clone(),
            env,
            steps,
            children,
            history: core.data.history.clone(),
        }
    }

    /// Deliver a timer firing. Stale timers (already cancelled, or their
    /// machine already terminal) are a logged no-op.
    pub(crate) fn timer_transition(
        &self,
        id: TimeoutId,
        target: State,
        on_fire: impl FnOnce(&mut StateData),
    ) {
        let mut core = self.inner.lock();
        if core.data.timeouts.remove(&id).is_none() {
            log::trace!("{}: stale timer {id:?} ignored", self.label());
            return;
        }
        if core.current.is_terminal() {
            return;
        }
        on_fire(&mut core.data);
        self.transition(&mut core, target);
        self.pump(&mut core);
    }

    fn pump(&self, core: &mut MachineCore) {
        while let Some(event) = core.queue.pop_front() {
            self.deliver(core, event);
        }
    }

    fn deliver(&self, core: &mut MachineCore, event: Event) {
        let state = core.current;
        let flow = {
            let Some(handler) = self.spec.handler(state, event.kind()) else {
                self.unhandled(core, event);
                return;
            };
            handler(self, &mut core.data, &event)
        };
        match flow {
            Flow::Handled => {}
            Flow::Fire(follow_up) => core.queue.push_back(follow_up),
            Flow::Transition(target) => self.transition(core, target),
        }
    }

    /// Undeclared events: `abort` is a benign no-op anywhere it is not
    /// declared; anything else is dropped in a terminal state and is a
    /// runtime bug in a non-terminal one.
    fn unhandled(&self, core: &mut MachineCore, event: Event) {
        match event {
            Event::Abort(_) => {
                log::trace!("{}: abort ignored in {}", self.label(), core.current);
            }
            event if core.current.is_terminal() => {
                log::debug!(
                    "{}: dropped {:?} in terminal state {}",
                    self.label(),
                    event.kind(),
                    core.current
                );
            }
            event => {
                log::error!(
                    "{}: no handler for {:?} in {}",
                    self.label(),
                    event.kind(),
                    core.current
                );
                core.data.fail_reason = Some(invalid_event_reason(core.current, &event));
                self.transition(core, State::Failed);
            }
        }
    }

    fn transition(&self, core: &mut MachineCore, target: State) {
        let mut target = target;
        loop {
            let from = core.current;
            if from.is_terminal() {
                log::trace!("{}: transition {from} -> {target} after terminal, ignored", self.label());
                return;
            }
            if !self.spec.allows(from, target) {
                log::error!("{}: undeclared transition {from} -> {target}", self.label());
                core.data.fail_reason = Some(invalid_transition_reason(from, target));
                target = State::Failed;
            }
            for hook in self.spec.on_exit(from) {
                match hook(self, &mut core.data) {
                    Flow::Handled => {}
                    flow => {
                        log::warn!(
                            "{}: exit hook on {from} returned {flow:?}, ignored",
                            self.label()
                        );
                        break;
                    }
                }
            }
            if self.spec.has_feature(Feature::History) {
                core.data.record_history(from);
            }
            core.current = target;
            log::trace!("{}: {from} -> {target}", self.label());
            match self.run_entry(core, target) {
                Some(next) => target = next,
                None => return,
            }
        }
    }

    /// Run an entry hook chain with guard semantics: the first hook that
    /// transitions or fires stops the chain. Returns a state the chain
    /// asked to move on to.
    fn run_entry(&self, core: &mut MachineCore, state: State) -> Option<State> {
        for hook in self.spec.on_enter(state) {
            match hook(self, &mut core.data) {
                Flow::Handled => {}
                Flow::Fire(event) => {
                    core.queue.push_back(event);
                    return None;
                }
                Flow::Transition(next) => return Some(next),
            }
        }
        None
    }

    fn label(&self) -> &str {
        self.spec.name().unwrap_or("fsm")
    }
}

fn child_states(machines: &[Arc<Machine>]) -> Vec<ChildStatus> {
    machines
        .iter()
        .enumerate()
        .map(|(index, m)| ChildStatus {
            index,
            state: m.current(),
        })
        .collect()
}

fn invalid_event_reason(state: State, event: &Event) -> FailReason {
    let mut entries = std::collections::BTreeMap::new();
    entries.insert("reason".to_owned(), Value::Str("invalid-event".to_owned()));
    entries.insert("event".to_owned(), Value::Str(format!("{:?}", event.kind())));
    entries.insert("state".to_owned(), Value::Str(state.to_string()));
    FailReason::Value(Value::Map(entries))
}

fn invalid_transition_reason(from: State, to: State) -> FailReason {
    let mut entries = std::collections::BTreeMap::new();
    entries.insert(
        "reason".to_owned(),
        Value::Str("invalid-transition".to_owned()),
    );
    entries.insert("from".to_owned(), Value::Str(from.to_string()));
    entries.insert("to".to_owned(), Value::Str(to.to_string()));
    FailReason::Value(Value::Map(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SpecBuilder;

    fn noop_spec(name: &str) -> FsmSpec {
        SpecBuilder::new()
            .name(name)
            .initial(State::Init)
            .transitions(State::Init, [State::Completed])
            .build()
    }

    #[test]
    fn merge_unions_transitions() {
        let a = SpecBuilder::new()
            .transitions(State::Init, [State::Running])
            .build();
        let b = SpecBuilder::new()
            .transitions(State::Init, [State::Completed])
            .build();
        let merged = FsmSpec::merge([a, b]);
        assert!(merged.allows(State::Init, State::Running));
        assert!(merged.allows(State::Init, State::Completed));
    }

    #[test]
    fn merge_name_first_non_null_wins() {
        let anon = SpecBuilder::new().build();
        let named = noop_spec("first");
        let other = noop_spec("second");
        let merged = FsmSpec::merge([anon, named, other]);
        assert_eq!(merged.name(), Some("first"));
    }

    #[test]
    fn merge_dedups_features() {
        let a = SpecBuilder::new().feature(Feature::LockTransition).build();
        let b = SpecBuilder::new()
            .feature(Feature::LockTransition)
            .feature(Feature::History)
            .build();
        let merged = FsmSpec::merge([a, b]);
        assert_eq!(merged.features, vec![Feature::LockTransition, Feature::History]);
    }

    #[test]
    fn merge_handlers_last_writer_wins() {
        let a = SpecBuilder::new()
            .handle(State::Init, EventKind::Start, |_, _, _| {
                Flow::Transition(State::Failed)
            })
            .build();
        let b = SpecBuilder::new()
            .handle(State::Init, EventKind::Start, |_, _, _| {
                Flow::Transition(State::Completed)
            })
            .build();
        let merged = FsmSpec::merge([a, b]);
        assert_eq!(merged.states[&State::Init].handlers.len(), 1);
    }

    #[tokio::test]
    async fn guarded_chain_stops_after_transition() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let second_ran = StdArc::new(AtomicBool::new(false));
        let flag = StdArc::clone(&second_ran);

        let inner = SpecBuilder::new()
            .initial(State::Init)
            .transitions(State::Init, [State::Running])
            .transitions(State::Running, [State::Completed])
            .handle(State::Init, EventKind::Start, |_, _, _| {
                Flow::Transition(State::Running)
            })
            .on_enter(State::Running, |_, _| Flow::Transition(State::Completed))
            .build();
        let wrapper = SpecBuilder::new()
            .on_enter(State::Running, move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Flow::Handled
            })
            .build();

        let merged = FsmSpec::merge([inner, wrapper]);
        let machine = Machine::materialize(merged, Pools::current(), None);
        machine.send(Event::Start);

        assert_eq!(machine.current(), State::Completed);
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unhandled_event_in_non_terminal_state_fails() {
        let spec = SpecBuilder::new()
            .name("bug")
            .initial(State::Init)
            .build();
        let machine = Machine::materialize(spec, Pools::current(), None);
        machine.send(Event::Complete);
        assert_eq!(machine.current(), State::Failed);
    }

    #[tokio::test]
    async fn abort_is_a_no_op_where_undeclared() {
        let spec = noop_spec("quiet");
        let machine = Machine::materialize(spec, Pools::current(), None);
        machine.send(Event::Abort(None));
        assert_eq!(machine.current(), State::Init);
    }
}
