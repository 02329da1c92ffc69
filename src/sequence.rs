//! The sequence controller: runs steps in source order, threading each
//! step's captured result into the env visible to later steps.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::builder::SpecBuilder;
use crate::error::{FailReason, StepError};
use crate::machine::{Event, EventKind, Feature, Flow, FsmSpec, Machine, State};
use crate::pools::panic_message;
use crate::primitives::{abort_flow, default_spec};
use crate::state::{Frame, SeqFrame, StateData};
use crate::steps::{Pattern, ResultFn, SpecFn, StepRecord};
use crate::value::{Env, Value};

/// Build a sequence from `(pattern, spec_fn)` pairs.
///
/// Prefer [`SequenceBuilder`] or the [`dofsm!`](crate::dofsm) macro; this
/// is the plain constructor for callers that assemble step lists
/// programmatically.
pub fn sequence<R>(name: impl Into<String>, steps: Vec<(Pattern, SpecFn)>, result: R) -> FsmSpec
where
    R: Fn(&Env) -> Result<Value, StepError> + Send + Sync + 'static,
{
    let mut builder = SequenceBuilder::named(name);
    for (i, (pattern, f)) in steps.into_iter().enumerate() {
        builder = builder.step(pattern, format!("step[{i}]"), move |env: &Env| f(env));
    }
    builder.result(result)
}

/// Incremental construction of a sequence specification.
///
/// Tracks the cumulative set of bound names so each [`StepRecord`]
/// carries the names visible after it runs.
#[derive(Default)]
pub struct SequenceBuilder {
    name: Option<String>,
    seed: Env,
    steps: Vec<StepRecord>,
    bound: Vec<String>,
}

impl SequenceBuilder {
    /// An anonymous sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// A named sequence; the name shows up in status and reports.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Pre-bind a name in the initial env.
    pub fn seed(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !self.bound.contains(&name) {
            self.bound.push(name.clone());
        }
        self.seed.bind(name, value.into());
        self
    }

    /// Append a step: `f` builds the child specification against the
    /// env, and `pattern` captures the child's result into it.
    pub fn step<F>(mut self, pattern: Pattern, op_sym: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Env) -> Result<FsmSpec, StepError> + Send + Sync + 'static,
    {
        for name in pattern.names() {
            if !self.bound.contains(&name) {
                self.bound.push(name);
            }
        }
        self.steps.push(StepRecord {
            f: Arc::new(f),
            pattern,
            syms: self.bound.clone().into(),
            op_sym: op_sym.into(),
        });
        self
    }

    /// Finish with a closure computing the overall result from the final
    /// env.
    pub fn result<F>(self, f: F) -> FsmSpec
    where
        F: Fn(&Env) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        controller(self.name, self.steps.into(), self.seed, Arc::new(f))
    }

    /// Finish by yielding the final value of one binding.
    pub fn result_of(self, name: impl Into<String>) -> FsmSpec {
        let name = name.into();
        self.result(move |env| Ok(env.lookup(&name)))
    }
}

/// The controller FSM for a step list.
fn controller(
    name: Option<String>,
    steps: Arc<[StepRecord]>,
    seed: Env,
    overall: ResultFn,
) -> FsmSpec {
    let mut builder = SpecBuilder::new()
        .feature(Feature::History)
        .transitions(State::Init, [State::Running])
        .transitions(
            State::Running,
            [State::StepCompleted, State::StepFailed, State::Aborted],
        )
        .transitions(
            State::StepCompleted,
            [State::Running, State::Completed, State::Failed, State::Aborted],
        )
        .transitions(State::StepFailed, [State::Failed, State::Aborted])
        .handle(State::Init, EventKind::Start, move |machine, data, _| {
            data.op_stack.push(Frame::Sequence(SeqFrame {
                env: seed.clone(),
                steps: Arc::clone(&steps),
                todo: 0,
                machines: Vec::new(),
                result_fn: None,
                overall_result_fn: Arc::clone(&overall),
            }));
            advance(machine, data)
        })
        .handle(State::Running, EventKind::StepComplete, |_, data, event| {
            let Event::StepComplete(result) = event else {
                return Flow::Handled;
            };
            capture_step(data, result.clone())
        })
        .handle(State::Running, EventKind::StepFail, |_, data, event| {
            let Event::StepFail(reason) = event else {
                return Flow::Handled;
            };
            data.fail_reason = Some(reason.clone());
            Flow::Transition(State::StepFailed)
        })
        .handle(State::Running, EventKind::StepAbort, |_, data, event| {
            let Event::StepAbort(reason) = event else {
                return Flow::Handled;
            };
            data.pop_frame();
            data.fail_reason = Some(reason.clone());
            Flow::Transition(State::Aborted)
        })
        .handle(State::Running, EventKind::Abort, forward_abort)
        .on_enter(State::StepCompleted, |_, data| {
            let more = data.seq_frame_mut().map(|f| !f.done()).unwrap_or(false);
            Flow::Fire(if more { Event::RunNextStep } else { Event::Complete })
        })
        .handle(State::StepCompleted, EventKind::RunNextStep, |machine, data, _| {
            run_step(machine, data)
        })
        .handle(State::StepCompleted, EventKind::Complete, |_, data, _| {
            finish(data)
        })
        .handle(State::StepCompleted, EventKind::Abort, forward_abort)
        .on_enter(State::StepFailed, |_, _| Flow::Fire(Event::Fail))
        .handle(State::StepFailed, EventKind::Fail, |_, data, _| {
            data.pop_frame();
            Flow::Transition(State::Failed)
        })
        .handle(State::StepFailed, EventKind::Abort, |_, data, event| {
            abort_flow(data, event)
        });
    if let Some(name) = name {
        builder = builder.name(name);
    }
    FsmSpec::merge([builder.build(), default_spec()])
}

/// Dispatch the next step, or finish when none remain.
fn advance(machine: &Machine, data: &mut StateData) -> Flow {
    let done = match data.seq_frame_mut() {
        Some(frame) => frame.done(),
        None => return Flow::Handled,
    };
    if done {
        finish(data)
    } else {
        run_step(machine, data)
    }
}

/// Build, wire, and start the next step's child machine.
fn run_step(machine: &Machine, data: &mut StateData) -> Flow {
    let (step, env) = match data.seq_frame_mut() {
        Some(frame) => (frame.steps[frame.todo].clone(), frame.env.clone()),
        None => return Flow::Handled,
    };
    let spec = match build_step_spec(&step, &env) {
        Ok(spec) => spec,
        Err(err) => {
            data.pop_frame();
            data.fail_reason = Some(FailReason::Step(err));
            return Flow::Transition(State::Failed);
        }
    };
    let patched = FsmSpec::merge([default_spec(), spec, step_patch(machine.weak())]);
    let child = Machine::materialize(patched, machine.pools().clone(), None);
    if let Some(frame) = data.seq_frame_mut() {
        frame.todo += 1;
        frame.machines.push(Arc::clone(&child));
        frame.result_fn = Some(step.pattern.clone());
    }
    machine.pools().execute(move || child.send(Event::Start));
    Flow::Transition(State::Running)
}

/// Capture a completed step's result into the env.
fn capture_step(data: &mut StateData, result: Value) -> Flow {
    let Some(frame) = data.seq_frame_mut() else {
        return Flow::Handled;
    };
    let Some(pattern) = frame.result_fn.take() else {
        return Flow::Handled;
    };
    match pattern.capture(&frame.env, result) {
        Ok(env) => {
            frame.env = env;
            Flow::Transition(State::StepCompleted)
        }
        Err(err) => {
            data.pop_frame();
            data.fail_reason = Some(FailReason::Step(err));
            Flow::Transition(State::Failed)
        }
    }
}

/// Pop the scope and compute the overall result.
fn finish(data: &mut StateData) -> Flow {
    let Some(Frame::Sequence(frame)) = data.pop_frame() else {
        return Flow::Handled;
    };
    let computed = catch_unwind(AssertUnwindSafe(|| (frame.overall_result_fn)(&frame.env)))
        .unwrap_or_else(|payload| {
            Err(StepError::Panic {
                op: "(result)".to_owned(),
                message: panic_message(&payload),
            })
        });
    match computed {
        Ok(value) => {
            data.result = value;
            Flow::Transition(State::Completed)
        }
        Err(err) => {
            data.fail_reason = Some(FailReason::Step(err));
            Flow::Transition(State::Failed)
        }
    }
}

/// Forward an abort to the live child, or abort the controller directly
/// when no child is in flight.
fn forward_abort(machine: &Machine, data: &mut StateData, event: &Event) -> Flow {
    let live = data.seq_frame_mut().and_then(|frame| {
        frame
            .machines
            .last()
            .filter(|child| !child.current().is_terminal())
            .map(Arc::clone)
    });
    match live {
        Some(child) => {
            let event = event.clone();
            machine.pools().execute(move || child.send(event));
            Flow::Handled
        }
        None => abort_flow(data, event),
    }
}

/// Run the step's constructor, converting panics into step errors.
fn build_step_spec(step: &StepRecord, env: &Env) -> Result<FsmSpec, StepError> {
    catch_unwind(AssertUnwindSafe(|| (step.f)(env))).unwrap_or_else(|payload| {
        Err(StepError::Panic {
            op: step.op_sym.clone(),
            message: panic_message(&payload),
        })
    })
}

/// Wire a step child's terminal states back to controller events,
/// delivered from a worker task.
fn step_patch(parent: Weak<Machine>) -> FsmSpec {
    let mut patch = SpecBuilder::new();
    for state in [State::Completed, State::Failed, State::Aborted, State::TimedOut] {
        let parent = parent.clone();
        patch = patch.on_enter(state, move |child, data| {
            let event = match state {
                State::Completed => Event::StepComplete(data.result.clone()),
                State::Aborted => Event::StepAbort(
                    data.fail_reason
                        .clone()
                        .unwrap_or(FailReason::Aborted(Value::Null)),
                ),
                _ => Event::StepFail(
                    data.fail_reason
                        .clone()
                        .unwrap_or(FailReason::Value(Value::Null)),
                ),
            };
            let parent = parent.clone();
            child.pools().execute(move || {
                if let Some(parent) = parent.upgrade() {
                    parent.send(event);
                }
            });
            Flow::Handled
        });
    }
    patch.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dofsm;
    use crate::operation::{operate, Outcome};
    use crate::primitives::{fail, result, succeed};

    #[tokio::test]
    async fn empty_sequence_completes_with_its_result() {
        let spec = SequenceBuilder::named("empty").result(|_| Ok(Value::Int(9)));
        let op = operate(spec);
        assert_eq!(op.wait().await, Outcome::Completed(Value::Int(9)));
    }

    #[tokio::test]
    async fn bindings_flow_into_later_steps() {
        let spec = dofsm! { flow,
            x <= result(10);
            y <= result(x.as_int().unwrap_or(0) * 2);
            => (x, y)
        };
        let op = operate(spec);
        assert_eq!(
            op.wait().await,
            Outcome::Completed(Value::List(vec![Value::Int(10), Value::Int(20)]))
        );
    }

    #[tokio::test]
    async fn rebinding_shadows_the_previous_value() {
        let spec = dofsm! { shadow,
            x <= result(1);
            x <= result(x.as_int().unwrap_or(0) + 2);
            => x
        };
        let op = operate(spec);
        assert_eq!(op.wait().await, Outcome::Completed(Value::Int(3)));
    }

    #[tokio::test]
    async fn failure_short_circuits_remaining_steps() {
        let spec = dofsm! { short,
            _ <= succeed();
            _ <= fail("nope");
            _ <= panic!("unreachable step must never be constructed");
            => ()
        };
        let op = operate(spec);
        assert_eq!(
            op.wait().await,
            Outcome::Failed(FailReason::Value(Value::Str("nope".into())))
        );
    }

    #[tokio::test]
    async fn panic_in_step_construction_becomes_a_step_error() {
        let spec = dofsm! { boom,
            _ <= panic!("constructor blew up");
            => ()
        };
        let op = operate(spec);
        let err = op.outcome().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::OpError::Step(StepError::Panic { .. })
        ));
    }

    #[tokio::test]
    async fn tuple_capture_destructures_a_list_result() {
        let spec = dofsm! { pair,
            (a, b) <= result(Value::List(vec![Value::Int(4), Value::Int(5)]));
            => b
        };
        let op = operate(spec);
        assert_eq!(op.wait().await, Outcome::Completed(Value::Int(5)));
    }

    #[tokio::test]
    async fn capture_mismatch_fails_the_sequence() {
        let spec = dofsm! { mismatch,
            (a, b) <= result(1);
            => a
        };
        let op = operate(spec);
        let err = op.outcome().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::OpError::Step(StepError::Capture { .. })
        ));
    }

    #[tokio::test]
    async fn nested_failure_propagates_verbatim() {
        let inner = dofsm! { inner,
            y <= fail("r");
            => y
        };
        let outer = SequenceBuilder::named("outer")
            .step(Pattern::name("x"), "inner", move |_| Ok(inner.clone()))
            .result_of("x");
        let op = operate(outer);
        assert_eq!(
            op.wait().await,
            Outcome::Failed(FailReason::Value(Value::Str("r".into())))
        );
    }

    #[tokio::test]
    async fn seeded_bindings_are_visible_to_the_first_step() {
        let spec = SequenceBuilder::named("seeded")
            .seed("base", 40)
            .step(Pattern::name("total"), "add", |env: &Env| {
                Ok(result(env.lookup("base").as_int().unwrap_or(0) + 2))
            })
            .result_of("total");
        let op = operate(spec);
        assert_eq!(op.wait().await, Outcome::Completed(Value::Int(42)));
    }
}
