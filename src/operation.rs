//! The operation runtime: materialize a specification, drive it, and
//! observe it through a handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::builder::SpecBuilder;
use crate::error::{FailReason, OpError};
use crate::machine::{Event, Flow, FsmSpec, Machine, OpStatus, State};
use crate::pools::Pools;
use crate::value::Value;

/// The single value an operation delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The operation completed with a result.
    Completed(Value),
    /// The operation failed, aborted, or timed out.
    Failed(FailReason),
}

/// A one-shot completion cell: written exactly once by whichever
/// terminal state is reached first, readable and awaitable thereafter.
/// Racing later writes are silently discarded.
pub struct CompletionSlot {
    cell: Mutex<Option<Outcome>>,
    tx: watch::Sender<bool>,
}

impl CompletionSlot {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cell: Mutex::new(None),
            tx,
        }
    }

    /// Deliver the outcome. Returns false when the slot was already
    /// realized, in which case `outcome` is dropped.
    pub fn deliver(&self, outcome: Outcome) -> bool {
        {
            let mut cell = self.cell.lock();
            if cell.is_some() {
                return false;
            }
            *cell = Some(outcome);
        }
        self.tx.send_replace(true);
        true
    }

    /// The delivered outcome, if any, without blocking.
    pub fn peek(&self) -> Option<Outcome> {
        self.cell.lock().clone()
    }

    /// True once an outcome was delivered.
    pub fn is_realized(&self) -> bool {
        self.cell.lock().is_some()
    }

    /// Wait for delivery.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            // The sender lives in self, so `changed` cannot error while
            // we hold `&self`.
            let _ = rx.changed().await;
        }
    }
}

/// Instantiate `spec` on the ambient tokio runtime and start it.
///
/// The operation is `running` by the time this returns; the returned
/// handle observes, awaits, and aborts it.
pub fn operate(spec: FsmSpec) -> Operation {
    operate_on(spec, Pools::current())
}

/// Like [`operate`], with explicit pools.
pub fn operate_on(spec: FsmSpec, pools: Pools) -> Operation {
    let slot = Arc::new(CompletionSlot::new());
    let merged = FsmSpec::merge([spec, delivery_spec()]);
    let machine = Machine::materialize(merged, pools, Some(Arc::clone(&slot)));
    machine.send(Event::Start);
    Operation { machine, slot }
}

/// Entry hooks on the four terminal states that deliver to the
/// completion slot. Merged after the user spec, so a compound's own
/// terminal bookkeeping runs first.
fn delivery_spec() -> FsmSpec {
    let mut builder = SpecBuilder::new().on_enter(State::Completed, |_, data| {
        if let Some(promise) = &data.promise {
            promise.deliver(Outcome::Completed(data.result.clone()));
        }
        Flow::Handled
    });
    for state in [State::Failed, State::Aborted, State::TimedOut] {
        builder = builder.on_enter(state, move |_, data| {
            if let Some(promise) = &data.promise {
                let reason = data
                    .fail_reason
                    .clone()
                    .unwrap_or(FailReason::Aborted(Value::Null));
                promise.deliver(Outcome::Failed(reason));
            }
            Flow::Handled
        });
    }
    builder.build()
}

/// Handle to a running (or finished) operation.
pub struct Operation {
    machine: Arc<Machine>,
    slot: Arc<CompletionSlot>,
}

impl Operation {
    /// Request cooperative cancellation. The request propagates down the
    /// currently active child chain; the operation terminates once the
    /// in-flight work observes it.
    pub fn abort(&self) {
        self.machine.send(Event::Abort(None));
    }

    /// [`abort`](Self::abort) with a reason that the terminal
    /// [`FailReason::Aborted`] will carry.
    pub fn abort_with(&self, reason: impl Into<Value>) {
        self.machine.send(Event::Abort(Some(reason.into())));
    }

    /// Consistent snapshot of the current state and state data.
    pub fn status(&self) -> OpStatus {
        self.machine.status()
    }

    /// `Some(true)` once completed, `Some(false)` once any non-success
    /// outcome is realized, `None` while still running.
    pub fn is_complete(&self) -> Option<bool> {
        self.slot
            .peek()
            .map(|outcome| matches!(outcome, Outcome::Completed(_)))
    }

    /// Mirror of [`is_complete`](Self::is_complete).
    pub fn is_failed(&self) -> Option<bool> {
        self.is_complete().map(|done| !done)
    }

    /// True until the completion slot is realized.
    pub fn is_running(&self) -> bool {
        !self.slot.is_realized()
    }

    /// Wait for the operation's outcome.
    pub async fn wait(&self) -> Outcome {
        self.slot.wait().await
    }

    /// Wait up to `timeout`; `None` when the operation is still running
    /// afterwards (supply a fallback at the call site with `unwrap_or`).
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Wait and unwrap: the result on completion, an error otherwise. An
    /// error captured from user code is re-surfaced as
    /// [`OpError::Step`].
    pub async fn outcome(&self) -> Result<Value, OpError> {
        unwrap_outcome(self.wait().await)
    }

    /// [`outcome`](Self::outcome) bounded by `timeout`.
    pub async fn outcome_timeout(&self, timeout: Duration) -> Option<Result<Value, OpError>> {
        self.wait_timeout(timeout).await.map(unwrap_outcome)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation({}: {})",
            self.machine.name().unwrap_or("anonymous"),
            self.machine.current()
        )
    }
}

fn unwrap_outcome(outcome: Outcome) -> Result<Value, OpError> {
    match outcome {
        Outcome::Completed(value) => Ok(value),
        Outcome::Failed(FailReason::Step(err)) => Err(OpError::Step(err)),
        Outcome::Failed(reason) => Err(OpError::Failed(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{delay, fail, result, TimeUnit};

    #[tokio::test]
    async fn slot_delivers_exactly_once() {
        let slot = CompletionSlot::new();
        assert!(slot.deliver(Outcome::Completed(Value::Int(1))));
        assert!(!slot.deliver(Outcome::Completed(Value::Int(2))));
        assert_eq!(slot.wait().await, Outcome::Completed(Value::Int(1)));
    }

    #[tokio::test]
    async fn completion_predicates_are_tri_state() {
        let op = operate(result(1));
        op.wait().await;
        assert_eq!(op.is_complete(), Some(true));
        assert_eq!(op.is_failed(), Some(false));
        assert!(!op.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn predicates_are_unknown_while_running() {
        let op = operate(delay(60, TimeUnit::Secs));
        assert_eq!(op.is_complete(), None);
        assert_eq!(op.is_failed(), None);
        assert!(op.is_running());
        op.abort();
        op.wait().await;
        assert_eq!(op.is_complete(), Some(false));
        assert_eq!(op.is_failed(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_yields_none_while_running() {
        let op = operate(delay(60, TimeUnit::Secs));
        let waited = op.wait_timeout(Duration::from_millis(10)).await;
        assert_eq!(waited, None);
        let fallback = waited.unwrap_or(Outcome::Completed(Value::Str("fallback".into())));
        assert_eq!(fallback, Outcome::Completed(Value::Str("fallback".into())));
    }

    #[tokio::test]
    async fn outcome_surfaces_failure_reasons() {
        let op = operate(fail("why"));
        assert_eq!(
            op.outcome().await,
            Err(OpError::Failed(FailReason::Value(Value::Str("why".into()))))
        );
    }

    #[tokio::test]
    async fn operation_debug_is_one_line() {
        let op = operate(result(1));
        op.wait().await;
        let rendered = format!("{op:?}");
        assert!(rendered.contains("completed"), "{rendered}");
    }
}
