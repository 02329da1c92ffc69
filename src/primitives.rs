//! Primitive FSM specifications: `result`, `succeed`, `fail`, `delay`.
//!
//! Each constructor returns a complete specification, pre-merged with
//! the default machine that declares the terminal vocabulary and abort
//! handling.

use std::time::Duration;

use crate::builder::SpecBuilder;
use crate::error::FailReason;
use crate::machine::{Event, EventKind, Feature, Flow, FsmSpec, State};
use crate::state::StateData;
use crate::timeout::timer_hooks;
use crate::value::Value;

/// Units accepted by [`delay`] and [`timeout`](crate::timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanos,
    /// Microseconds.
    Micros,
    /// Milliseconds.
    Millis,
    /// Seconds.
    Secs,
    /// Minutes.
    Mins,
    /// Hours.
    Hours,
}

impl TimeUnit {
    /// Convert an amount of this unit into a [`Duration`].
    pub fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanos => Duration::from_nanos(amount),
            TimeUnit::Micros => Duration::from_micros(amount),
            TimeUnit::Millis => Duration::from_millis(amount),
            TimeUnit::Secs => Duration::from_secs(amount),
            TimeUnit::Mins => Duration::from_secs(amount * 60),
            TimeUnit::Hours => Duration::from_secs(amount * 3600),
        }
    }
}

/// The default machine every primitive and combinator merges with:
/// declares `init` plus the terminal vocabulary, aborts cooperatively
/// from `init`, and serializes transitions.
pub(crate) fn default_spec() -> FsmSpec {
    SpecBuilder::new()
        .initial(State::Init)
        .feature(Feature::LockTransition)
        .transitions(State::Init, [State::Completed, State::Failed, State::Aborted])
        .transitions(State::Completed, [])
        .transitions(State::Failed, [])
        .transitions(State::Aborted, [])
        .transitions(State::TimedOut, [])
        .handle(State::Init, EventKind::Abort, |_, data, event| {
            abort_flow(data, event)
        })
        .build()
}

/// Shared cooperative-abort behavior: pop the current scope, record the
/// abort reason, enter `aborted`.
pub(crate) fn abort_flow(data: &mut StateData, event: &Event) -> Flow {
    let reason = match event {
        Event::Abort(Some(value)) => value.clone(),
        _ => Value::Null,
    };
    data.pop_frame();
    data.fail_reason = Some(FailReason::Aborted(reason));
    Flow::Transition(State::Aborted)
}

/// A specification that completes immediately with `value`.
pub fn result(value: impl Into<Value>) -> FsmSpec {
    let value = value.into();
    let spec = SpecBuilder::new()
        .handle(State::Init, EventKind::Start, move |_, data, _| {
            data.result = value.clone();
            Flow::Transition(State::Completed)
        })
        .build();
    FsmSpec::merge([spec, default_spec()])
}

/// A specification that completes immediately with no result.
pub fn succeed() -> FsmSpec {
    let spec = SpecBuilder::new()
        .handle(State::Init, EventKind::Start, |_, _, _| {
            Flow::Transition(State::Completed)
        })
        .build();
    FsmSpec::merge([spec, default_spec()])
}

/// Completes when `flag` is true, otherwise fails with `reason`.
pub fn succeed_if(flag: bool, reason: impl Into<Value>) -> FsmSpec {
    let reason = reason.into();
    let spec = SpecBuilder::new()
        .handle(State::Init, EventKind::Start, move |_, data, _| {
            if flag {
                Flow::Transition(State::Completed)
            } else {
                data.fail_reason = Some(FailReason::Value(reason.clone()));
                Flow::Transition(State::Failed)
            }
        })
        .build();
    FsmSpec::merge([spec, default_spec()])
}

/// A specification that fails immediately with `reason`, propagated
/// verbatim.
pub fn fail(reason: impl Into<Value>) -> FsmSpec {
    let reason = reason.into();
    let spec = SpecBuilder::new()
        .handle(State::Init, EventKind::Start, move |_, data, _| {
            data.fail_reason = Some(FailReason::Value(reason.clone()));
            Flow::Transition(State::Failed)
        })
        .build();
    FsmSpec::merge([spec, default_spec()])
}

/// A specification that completes after the given amount of time.
///
/// The timer is armed on entry to `running` and cancelled on exit, so an
/// abort during the wait cleans up after itself.
pub fn delay(amount: u64, unit: TimeUnit) -> FsmSpec {
    let duration = unit.duration(amount);
    let (arm, cancel) = timer_hooks(State::Running, duration, State::Completed, |_| {});
    let spec = SpecBuilder::new()
        .transitions(State::Init, [State::Running])
        .transitions(State::Running, [State::Completed, State::Aborted])
        .handle(State::Init, EventKind::Start, |_, _, _| {
            Flow::Transition(State::Running)
        })
        .handle(State::Running, EventKind::Abort, |_, data, event| {
            abort_flow(data, event)
        })
        .on_enter(State::Running, arm)
        .on_exit(State::Running, cancel)
        .build();
    FsmSpec::merge([spec, default_spec()])
}
