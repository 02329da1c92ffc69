//! The parallel combinator: run several specifications concurrently and
//! collect their results in input order.

use std::sync::{Arc, Weak};

use crate::builder::SpecBuilder;
use crate::error::FailReason;
use crate::machine::{Event, EventKind, Flow, FsmSpec, Machine, State};
use crate::primitives::{abort_flow, default_spec};
use crate::state::{Frame, OpSnapshot, ParFrame, StateData};
use crate::value::Value;

/// Run every child specification concurrently.
///
/// All children are materialized before any is started; each start is
/// dispatched on its own worker task. The compound completes with the
/// children's results in input order, or fails with
/// [`FailReason::FailedOps`] collecting every failed child's reason. An
/// empty input completes immediately with `Null`.
pub fn parallel(children: impl IntoIterator<Item = FsmSpec>) -> FsmSpec {
    let children: Arc<[FsmSpec]> = children.into_iter().collect();
    let spec = SpecBuilder::new()
        .transitions(State::Init, [State::Running])
        .transitions(State::Running, [State::OpsComplete])
        .transitions(
            State::OpsComplete,
            [State::Completed, State::Failed, State::Aborted],
        )
        .handle(State::Init, EventKind::Start, move |machine, data, _| {
            if children.is_empty() {
                data.result = Value::Null;
                return Flow::Transition(State::Completed);
            }
            let mut machines = Vec::with_capacity(children.len());
            for (index, child) in children.iter().enumerate() {
                let patched = FsmSpec::merge([
                    default_spec(),
                    child.clone(),
                    child_patch(index, machine.weak()),
                ]);
                machines.push(Machine::materialize(patched, machine.pools().clone(), None));
            }
            data.op_stack.push(Frame::Parallel(ParFrame {
                pending: (0..machines.len()).collect(),
                completed: Vec::new(),
                failed: Vec::new(),
                machines,
            }));
            Flow::Transition(State::Running)
        })
        .on_enter(State::Running, |machine, data| {
            if let Some(frame) = data.par_frame_mut() {
                for child in &frame.machines {
                    let child = Arc::clone(child);
                    machine.pools().execute(move || child.send(Event::Start));
                }
            }
            Flow::Handled
        })
        .handle(State::Running, EventKind::OpComplete, |_, data, event| {
            let Event::OpComplete(snapshot) = event else {
                return Flow::Handled;
            };
            child_done(data, snapshot.clone())
        })
        .handle(State::Running, EventKind::OpFail, |_, data, event| {
            let Event::OpFail(snapshot) = event else {
                return Flow::Handled;
            };
            child_done(data, snapshot.clone())
        })
        .handle(State::Running, EventKind::Abort, |machine, data, event| {
            // Forward to every still-pending child and keep collecting;
            // the children's terminal snapshots drive the shutdown.
            if let Some(frame) = data.par_frame_mut() {
                for index in frame.pending.iter().copied() {
                    let child = Arc::clone(&frame.machines[index]);
                    let event = event.clone();
                    machine.pools().execute(move || child.send(event));
                }
            }
            Flow::Handled
        })
        .on_enter(State::OpsComplete, |_, data| {
            let any_failed = data
                .par_frame_mut()
                .map(|frame| !frame.failed.is_empty())
                .unwrap_or(false);
            Flow::Fire(if any_failed { Event::Fail } else { Event::Complete })
        })
        .handle(State::OpsComplete, EventKind::Complete, |_, data, _| {
            let Some(Frame::Parallel(frame)) = data.pop_frame() else {
                return Flow::Handled;
            };
            data.result = collected_results(frame.completed);
            Flow::Transition(State::Completed)
        })
        .handle(State::OpsComplete, EventKind::Fail, |_, data, _| {
            let Some(Frame::Parallel(frame)) = data.pop_frame() else {
                return Flow::Handled;
            };
            let reasons = frame
                .failed
                .into_iter()
                .map(|snapshot| {
                    snapshot
                        .fail_reason
                        .unwrap_or(FailReason::Value(Value::Null))
                })
                .collect();
            data.result = collected_results(frame.completed);
            data.fail_reason = Some(FailReason::FailedOps(reasons));
            Flow::Transition(State::Failed)
        })
        .handle(State::OpsComplete, EventKind::Abort, |_, data, event| {
            abort_flow(data, event)
        })
        .build();
    FsmSpec::merge([spec, default_spec()])
}

/// Settle one child's terminal snapshot; move on once none are pending.
fn child_done(data: &mut StateData, snapshot: OpSnapshot) -> Flow {
    let Some(frame) = data.par_frame_mut() else {
        return Flow::Handled;
    };
    if !frame.pending.remove(&snapshot.index) {
        return Flow::Handled;
    }
    if snapshot.state == State::Completed {
        frame.completed.push(snapshot);
    } else {
        frame.failed.push(snapshot);
    }
    if frame.pending.is_empty() {
        Flow::Transition(State::OpsComplete)
    } else {
        Flow::Handled
    }
}

/// Children's results in input order, regardless of completion order.
fn collected_results(mut completed: Vec<OpSnapshot>) -> Value {
    completed.sort_by_key(|snapshot| snapshot.index);
    Value::List(completed.into_iter().map(|s| s.result).collect())
}

/// Wire a child's terminal states back to parent events, delivered from
/// a worker task so the two transition locks stay decoupled.
fn child_patch(index: usize, parent: Weak<Machine>) -> FsmSpec {
    let mut patch = SpecBuilder::new();
    for state in [State::Completed, State::Failed, State::Aborted, State::TimedOut] {
        let parent = parent.clone();
        patch = patch.on_enter(state, move |child, data| {
            let snapshot = OpSnapshot {
                index,
                state,
                result: data.result.clone(),
                fail_reason: data.fail_reason.clone(),
            };
            let event = if state == State::Completed {
                Event::OpComplete(snapshot)
            } else {
                Event::OpFail(snapshot)
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
