//! Per-machine runtime state: the state-data record, operation frames,
//! and history entries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::FailReason;
use crate::machine::{Machine, State};
use crate::operation::CompletionSlot;
use crate::pools::TimerHandle;
use crate::steps::{Pattern, ResultFn, StepRecord};
use crate::value::{Env, Value};

/// Identifier for an armed per-state timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

impl TimeoutId {
    /// Mint a fresh, process-unique id.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TimeoutId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Terminal snapshot of a parallel child, carried by the parent's
/// `op-complete`/`op-fail` events.
#[derive(Debug, Clone)]
pub struct OpSnapshot {
    /// Position of the child in the parallel's input order.
    pub index: usize,
    /// Terminal state the child reached.
    pub state: State,
    /// The child's result at that point.
    pub result: Value,
    /// The child's fail reason, if any.
    pub fail_reason: Option<FailReason>,
}

/// A past state, recorded on exit when the `History` feature is on.
///
/// Entries are sanitized by construction: the completion slot, armed
/// timers, and frame bookkeeping never appear here.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// The state that was exited.
    pub state: State,
    /// The result at exit time.
    pub result: Value,
    /// The fail reason at exit time, if any.
    pub fail_reason: Option<FailReason>,
    /// The top frame's env at exit time, for sequence controllers.
    pub env: Option<Env>,
}

/// Scope bookkeeping for a running sequence controller.
pub struct SeqFrame {
    /// Bindings visible so far.
    pub env: Env,
    /// The full, immutable step list.
    pub steps: Arc<[StepRecord]>,
    /// Index of the next step to run.
    pub todo: usize,
    /// Child machines materialized so far, in step order.
    pub machines: Vec<Arc<Machine>>,
    /// Capture pattern for the step currently in flight.
    pub result_fn: Option<Pattern>,
    /// Computes the compound result from the final env.
    pub overall_result_fn: ResultFn,
}

impl SeqFrame {
    /// True when every step has been dispatched.
    pub fn done(&self) -> bool {
        self.todo >= self.steps.len()
    }
}

/// Scope bookkeeping for a running parallel.
pub struct ParFrame {
    /// Input indices of children that have not yet reached a terminal
    /// state.
    pub pending: HashSet<usize>,
    /// Snapshots of children that completed, in completion order.
    pub completed: Vec<OpSnapshot>,
    /// Snapshots of children that failed or aborted, in completion order.
    pub failed: Vec<OpSnapshot>,
    /// All child machines, in input order.
    pub machines: Vec<Arc<Machine>>,
}

/// A per-scope operation frame pushed on the op-stack by the sequential
/// and parallel combinators.
pub enum Frame {
    /// A sequence controller's scope.
    Sequence(SeqFrame),
    /// A parallel's scope.
    Parallel(ParFrame),
}

/// The mutable record every machine instance carries through its life.
///
/// All access is serialized by the machine's transition lock.
pub struct StateData {
    /// User-facing result once `completed`.
    pub result: Value,
    /// Why a non-`completed` terminal state was reached.
    pub fail_reason: Option<FailReason>,
    /// LIFO stack of per-scope operation frames.
    pub op_stack: Vec<Frame>,
    /// Single-shot completion slot; present only on the root machine of
    /// an operation.
    pub promise: Option<Arc<CompletionSlot>>,
    /// Armed per-state timers by id.
    pub timeouts: HashMap<TimeoutId, TimerHandle>,
    /// Ids armed on entry to a state, keyed by that state so the paired
    /// exit hook can find them.
    pub(crate) armed: HashMap<State, Vec<TimeoutId>>,
    /// Past states, oldest first.
    pub history: Vec<HistoryEntry>,
}

impl StateData {
    pub(crate) fn new(promise: Option<Arc<CompletionSlot>>) -> Self {
        Self {
            result: Value::Null,
            fail_reason: None,
            op_stack: Vec::new(),
            promise,
            timeouts: HashMap::new(),
            armed: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Register a freshly armed timer for `state`.
    pub(crate) fn arm(&mut self, state: State, id: TimeoutId, handle: TimerHandle) {
        self.timeouts.insert(id, handle);
        self.armed.entry(state).or_default().push(id);
    }

    /// Remove and cancel every timer armed for `state`. Best-effort: a
    /// timer that already fired is simply no longer present.
    pub(crate) fn disarm(&mut self, state: State) {
        for id in self.armed.remove(&state).unwrap_or_default() {
            if let Some(handle) = self.timeouts.remove(&id) {
                handle.cancel();
            }
        }
    }

    /// The top frame as a sequence scope, if it is one.
    pub fn seq_frame_mut(&mut self) -> Option<&mut SeqFrame> {
        match self.op_stack.last_mut() {
            Some(Frame::Sequence(f)) => Some(f),
            _ => None,
        }
    }

    /// The top frame as a parallel scope, if it is one.
    pub fn par_frame_mut(&mut self) -> Option<&mut ParFrame> {
        match self.op_stack.last_mut() {
            Some(Frame::Parallel(f)) => Some(f),
            _ => None,
        }
    }

    /// Pop the current scope, if any.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.op_stack.pop()
    }

    pub(crate) fn record_history(&mut self, exited: State) {
        let env = match self.op_stack.last() {
            Some(Frame::Sequence(f)) => Some(f.env.clone()),
            _ => None,
        };
        self.history.push(HistoryEntry {
            state: exited,
            result: self.result.clone(),
            fail_reason: self.fail_reason.clone(),
            env,
        });
    }
}
