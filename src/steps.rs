//! Step records and the binding comprehension surface.
//!
//! A sequence is a list of [`StepRecord`]s. Each record carries a
//! constructor closure (env in, child specification out), a capture
//! [`Pattern`] for the step's result, the cumulative set of names bound
//! after the step, and a debug rendering of the source expression.
//!
//! The [`dofsm!`](crate::dofsm) macro compiles the surface binding form
//! down to these records: previously bound names become `Value` locals
//! inside each step expression, and the final `=>` expression computes
//! the compound result.

use std::fmt;
use std::sync::Arc;

use crate::error::StepError;
use crate::machine::FsmSpec;
use crate::value::{Env, Value};

/// Constructs a step's child specification from the bindings visible so
/// far.
pub type SpecFn = Arc<dyn Fn(&Env) -> Result<FsmSpec, StepError> + Send + Sync>;

/// Computes a sequence's overall result from its final env.
pub type ResultFn = Arc<dyn Fn(&Env) -> Result<Value, StepError> + Send + Sync>;

/// Typed destructuring descriptor for a step's capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Discard the step's result.
    Ignore,
    /// Bind the whole result to one name.
    Bind(String),
    /// Destructure a list result element-wise.
    Tuple(Vec<Pattern>),
}

impl Pattern {
    /// A single-name binding.
    pub fn name(name: impl Into<String>) -> Self {
        Pattern::Bind(name.into())
    }

    /// A list destructuring.
    pub fn tuple(patterns: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::Tuple(patterns.into_iter().collect())
    }

    /// Names this pattern introduces, in source order.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Pattern::Ignore => {}
            Pattern::Bind(name) => out.push(name.clone()),
            Pattern::Tuple(patterns) => {
                for p in patterns {
                    p.collect_names(out);
                }
            }
        }
    }

    /// Apply the pattern: produce the env extended with this step's
    /// bindings. Rebinding shadows.
    pub fn capture(&self, env: &Env, value: Value) -> Result<Env, StepError> {
        let mut next = env.clone();
        self.capture_into(&mut next, value)?;
        Ok(next)
    }

    fn capture_into(&self, env: &mut Env, value: Value) -> Result<(), StepError> {
        match self {
            Pattern::Ignore => Ok(()),
            Pattern::Bind(name) => {
                env.bind(name.clone(), value);
                Ok(())
            }
            Pattern::Tuple(patterns) => match value {
                Value::List(items) if items.len() == patterns.len() => {
                    for (p, item) in patterns.iter().zip(items) {
                        p.capture_into(env, item)?;
                    }
                    Ok(())
                }
                other => Err(StepError::Capture {
                    pattern: self.to_string(),
                    value: other.to_string(),
                }),
            },
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Ignore => write!(f, "_"),
            Pattern::Bind(name) => write!(f, "{name}"),
            Pattern::Tuple(patterns) => {
                write!(f, "(")?;
                for (i, p) in patterns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One binding of a sequence comprehension.
#[derive(Clone)]
pub struct StepRecord {
    /// Constructs the step's child specification against the current env.
    pub f: SpecFn,
    /// Capture pattern for the step's result.
    pub pattern: Pattern,
    /// All names visible after this step, cumulative in source order.
    pub syms: Arc<[String]>,
    /// Debug name of the source expression.
    pub op_sym: String,
}

impl fmt::Debug for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRecord")
            .field("pattern", &self.pattern)
            .field("syms", &self.syms)
            .field("op_sym", &self.op_sym)
            .finish_non_exhaustive()
    }
}

/// Sequential binding comprehension.
///
/// Expands to a [`SequenceBuilder`](crate::SequenceBuilder) chain. Each
/// step is `pattern <= spec_expr;` where `pattern` is `_`, a name, or a
/// parenthesized name tuple, and `spec_expr` evaluates to an
/// [`FsmSpec`](crate::FsmSpec) with every previously bound name in scope
/// as a [`Value`](crate::Value). The trailing `=> expr` computes the
/// overall result.
///
/// ```
/// use fsmop::{dofsm, operate, result, Outcome, Value};
///
/// # tokio_test::block_on(async {
/// let spec = dofsm! { add_one,
///     x <= result(1);
///     y <= result(x.as_int().unwrap_or(0) + 1);
///     => y
/// };
/// let op = operate(spec);
/// assert_eq!(op.wait().await, Outcome::Completed(Value::Int(2)));
/// # });
/// ```
#[macro_export]
macro_rules! dofsm {
    ($name:ident , $($rest:tt)+) => {
        $crate::__dofsm!(@step [$crate::SequenceBuilder::named(stringify!($name))] [] $($rest)+)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __dofsm {
    // Final result expression.
    (@step [$builder:expr] [$($bound:ident)*] => $result:expr $(;)?) => {
        $builder.result(move |env: &$crate::Env| {
            let _ = env;
            $(let $bound = env.lookup(stringify!($bound)); let _ = &$bound;)*
            ::core::result::Result::Ok($crate::Value::from($result))
        })
    };
    // Discarding step.
    (@step [$builder:expr] [$($bound:ident)*] _ <= $spec:expr ; $($rest:tt)+) => {
        $crate::__dofsm!(@step
            [$builder.step($crate::Pattern::Ignore, stringify!($spec), move |env: &$crate::Env| {
                let _ = env;
                $(let $bound = env.lookup(stringify!($bound)); let _ = &$bound;)*
                ::core::result::Result::Ok($spec)
            })]
            [$($bound)*]
            $($rest)+
        )
    };
    // Tuple-destructuring step.
    (@step [$builder:expr] [$($bound:ident)*] ($($var:ident),+) <= $spec:expr ; $($rest:tt)+) => {
        $crate::__dofsm!(@step
            [$builder.step(
                $crate::Pattern::tuple([$($crate::Pattern::name(stringify!($var))),+]),
                stringify!($spec),
                move |env: &$crate::Env| {
                    let _ = env;
                    $(let $bound = env.lookup(stringify!($bound)); let _ = &$bound;)*
                    ::core::result::Result::Ok($spec)
                },
            )]
            [$($bound)* $($var)+]
            $($rest)+
        )
    };
    // Single-name step.
    (@step [$builder:expr] [$($bound:ident)*] $var:ident <= $spec:expr ; $($rest:tt)+) => {
        $crate::__dofsm!(@step
            [$builder.step($crate::Pattern::name(stringify!($var)), stringify!($spec), move |env: &$crate::Env| {
                let _ = env;
                $(let $bound = env.lookup(stringify!($bound)); let _ = &$bound;)*
                ::core::result::Result::Ok($spec)
            })]
            [$($bound)* $var]
            $($rest)+
        )
    };
}
