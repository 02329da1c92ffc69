//! # fsmop
//!
//! Composable finite-state-machine operations for async Rust.
//!
//! A unit of asynchronous work is an FSM with a fixed terminal
//! vocabulary (`completed`, `failed`, `aborted`, `timed-out`).
//! Specifications are pure values; combinators build larger machines out
//! of smaller ones by merging their state graphs; the runtime
//! materializes a specification into a running operation whose status is
//! observable, whose result is awaitable, and which can be externally
//! aborted.
//!
//! ## Features
//!
//! - **Primitives**: [`result`], [`succeed`], [`fail`], [`delay`]
//! - **Combinators**: [`sequence`], [`parallel`], [`reduce`],
//!   [`timeout`] — each preserves the terminal vocabulary
//! - **Binding comprehension**: the [`dofsm!`] macro threads each step's
//!   typed result into the steps after it
//! - **Cooperative cancellation**: `abort` propagates down the active
//!   child chain
//! - **Introspection**: consistent status snapshots and a
//!   [`report_operation`] pretty-printer
//!
//! ## Quick start
//!
//! ```
//! use fsmop::{dofsm, operate, parallel, result, Outcome, Value};
//!
//! tokio_test::block_on(async {
//!     let spec = dofsm! { fetch_both,
//!         pair <= parallel([result(1), result(2)]);
//!         => pair
//!     };
//!     let op = operate(spec);
//!     assert_eq!(
//!         op.wait().await,
//!         Outcome::Completed(Value::List(vec![Value::Int(1), Value::Int(2)]))
//!     );
//! });
//! ```

#![warn(missing_docs)]

mod builder;
mod error;
mod machine;
mod operation;
mod parallel;
mod pools;
mod primitives;
mod reduce;
mod report;
mod sequence;
mod state;
mod steps;
mod timeout;
mod value;

pub use builder::SpecBuilder;
pub use error::{FailReason, OpError, OpResult, StepError};
pub use machine::{
    ChildStatus, Event, EventKind, Feature, Flow, FsmSpec, Handler, Hook, Machine, OpStatus,
    State, StepStatus,
};
pub use operation::{operate, operate_on, CompletionSlot, Operation, Outcome};
pub use parallel::parallel;
pub use pools::{Pools, TimerHandle};
pub use primitives::{delay, fail, result, succeed, succeed_if, TimeUnit};
pub use reduce::reduce;
pub use report::{report_operation, ReportOptions};
pub use sequence::{sequence, SequenceBuilder};
pub use state::{Frame, HistoryEntry, OpSnapshot, ParFrame, SeqFrame, StateData, TimeoutId};
pub use steps::{Pattern, ResultFn, SpecFn, StepRecord};
pub use timeout::timeout;
pub use value::{Env, Value};

pub mod prelude {
    //! Convenient imports for typical use.

    pub use crate::{
        delay, dofsm, fail, operate, operate_on, parallel, reduce, report_operation, result,
        sequence, succeed, succeed_if, timeout, Env, FailReason, FsmSpec, OpError, Operation,
        Outcome, Pattern, Pools, ReportOptions, SequenceBuilder, StepError, TimeUnit, Value,
    };
}
