//! Error types for the operation engine.

use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// Result alias for fallible engine operations.
pub type OpResult<T> = std::result::Result<T, OpError>;

/// An error raised by user code while a sequence runs: constructing a
/// step's specification, capturing its result, or computing the overall
/// result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// Step construction returned an error.
    #[error("{op}: {message}")]
    Construct {
        /// Debug name of the source expression.
        op: String,
        /// The error's message.
        message: String,
    },

    /// Step construction or result computation panicked.
    #[error("{op} panicked: {message}")]
    Panic {
        /// Debug name of the source expression.
        op: String,
        /// The panic payload, rendered.
        message: String,
    },

    /// A capture pattern could not destructure the step's result.
    #[error("pattern {pattern} cannot capture {value}")]
    Capture {
        /// The pattern, rendered.
        pattern: String,
        /// The offending value, rendered.
        value: String,
    },
}

/// Why an operation reached a non-`completed` terminal state.
///
/// The shapes here are stable and externally observable: a timeout is
/// always `TimedOut`, a parallel failure is always `FailedOps` carrying
/// the children's reasons, a user `fail(x)` propagates `x` verbatim, and
/// an error in user code travels as `Step` and is re-surfaced by
/// [`Operation::outcome`](crate::Operation::outcome).
#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    /// A user-supplied reason, propagated verbatim.
    Value(Value),
    /// A per-state timeout fired.
    TimedOut,
    /// One or more parallel children failed.
    FailedOps(Vec<FailReason>),
    /// The operation was externally aborted, with the abort reason.
    Aborted(Value),
    /// User code raised while constructing or capturing a step.
    Step(StepError),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Value(v) => write!(f, "{v}"),
            FailReason::TimedOut => write!(f, "timed-out"),
            FailReason::FailedOps(reasons) => {
                write!(f, "failed-ops [")?;
                for (i, r) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                write!(f, "]")
            }
            FailReason::Aborted(Value::Null) => write!(f, "aborted"),
            FailReason::Aborted(v) => write!(f, "aborted: {v}"),
            FailReason::Step(e) => write!(f, "{e}"),
        }
    }
}

/// The caller-facing error of [`Operation::outcome`](crate::Operation::outcome).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    /// User code raised; the original error re-surfaced to the caller.
    #[error(transparent)]
    Step(#[from] StepError),

    /// The operation reached `failed`, `aborted`, or `timed-out`.
    #[error("operation failed: {0}")]
    Failed(FailReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_ops_display_nests() {
        let reason = FailReason::FailedOps(vec![
            FailReason::TimedOut,
            FailReason::Value(Value::Str("nok".into())),
        ]);
        assert_eq!(reason.to_string(), "failed-ops [timed-out, \"nok\"]");
    }

    #[test]
    fn step_error_is_transparent() {
        let err = OpError::from(StepError::Capture {
            pattern: "(a, b)".into(),
            value: "1".into(),
        });
        assert_eq!(err.to_string(), "pattern (a, b) cannot capture 1");
    }
}
