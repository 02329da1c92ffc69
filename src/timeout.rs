//! The per-state timeout wrapper.

use std::time::Duration;

use crate::builder::SpecBuilder;
use crate::error::FailReason;
use crate::machine::{Flow, FsmSpec, Machine, State};
use crate::primitives::TimeUnit;
use crate::state::{StateData, TimeoutId};

/// Build the arm/cancel hook pair for a one-shot timer on `state`.
///
/// The entry hook mints a fresh [`TimeoutId`], schedules the timer, and
/// records the cancellable handle in the machine's `timeouts` map; the
/// exit hook removes and cancels it. A timer that fires after its state
/// was exited finds its id gone and is a logged no-op, so cancellation
/// stays best-effort.
pub(crate) fn timer_hooks(
    state: State,
    duration: Duration,
    target: State,
    on_fire: fn(&mut StateData),
) -> (
    impl Fn(&Machine, &mut StateData) -> Flow + Send + Sync + 'static,
    impl Fn(&Machine, &mut StateData) -> Flow + Send + Sync + 'static,
) {
    let arm = move |machine: &Machine, data: &mut StateData| {
        let id = TimeoutId::next();
        let weak = machine.weak();
        let handle = machine.pools().schedule(duration, move || {
            if let Some(machine) = weak.upgrade() {
                machine.timer_transition(id, target, on_fire);
            }
        });
        data.arm(state, id, handle);
        Flow::Handled
    };
    let cancel = move |_: &Machine, data: &mut StateData| {
        data.disarm(state);
        Flow::Handled
    };
    (arm, cancel)
}

/// Wrap `child` so that staying in any one non-terminal state longer
/// than the given amount fails the operation with
/// [`FailReason::TimedOut`].
///
/// The budget is per state, not per operation: every transition clears
/// the previous timer and entering the next state re-arms it. Wrapping a
/// sequence therefore budgets each controller state; a caller who wants
/// an end-to-end budget wraps the outer compound, and one who wants
/// per-step budgets wraps each step's specification.
pub fn timeout(child: FsmSpec, amount: u64, unit: TimeUnit) -> FsmSpec {
    let duration = unit.duration(amount);
    let mut patch = SpecBuilder::new();
    for state in child.declared_states() {
        if state.is_terminal() {
            continue;
        }
        let (arm, cancel) = timer_hooks(state, duration, State::Failed, |data| {
            data.fail_reason = Some(FailReason::TimedOut);
        });
        patch = patch
            .transitions(state, [State::Failed])
            .on_enter(state, arm)
            .on_exit(state, cancel);
    }
    FsmSpec::merge([child, patch.build()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailReason;
    use crate::operation::{operate, Outcome};
    use crate::primitives::{delay, result};
    use crate::value::Value;

    #[tokio::test(start_paused = true)]
    async fn times_out_a_slow_child() {
        let started = tokio::time::Instant::now();
        let op = operate(timeout(delay(1000, TimeUnit::Millis), 500, TimeUnit::Millis));
        let outcome = op.wait().await;
        let elapsed = started.elapsed();
        assert_eq!(outcome, Outcome::Failed(FailReason::TimedOut));
        assert!(elapsed < Duration::from_millis(900), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn generous_budget_lets_the_child_complete() {
        let op = operate(timeout(delay(1000, TimeUnit::Millis), 2000, TimeUnit::Millis));
        assert_eq!(op.wait().await, Outcome::Completed(Value::Null));
    }

    #[tokio::test]
    async fn fast_child_is_untouched() {
        let op = operate(timeout(result(7), 1, TimeUnit::Secs));
        assert_eq!(op.wait().await, Outcome::Completed(Value::Int(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_rearms_per_controller_state() {
        use crate::dofsm;

        // The budget is per state, not end-to-end: the controller spends
        // ~400ms in `running` twice (800ms total) yet a 500ms budget
        // passes, because every transition re-arms the timer.
        let steps = dofsm! { two_delays,
            _ <= delay(400, TimeUnit::Millis);
            _ <= delay(400, TimeUnit::Millis);
            => ()
        };
        let op = operate(timeout(steps, 500, TimeUnit::Millis));
        assert_eq!(op.wait().await, Outcome::Completed(Value::Null));
    }
}
