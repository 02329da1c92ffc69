//! Sequential fold over a collection of inputs, re-expressed as a
//! sequence threading a reserved accumulator binding.

use std::sync::Arc;

use crate::error::StepError;
use crate::machine::FsmSpec;
use crate::sequence::SequenceBuilder;
use crate::steps::Pattern;
use crate::value::{Env, Value};

/// The per-scope accumulator binding. Not part of the public surface;
/// user patterns never collide with it.
const ACC: &str = "%acc";

/// Fold `inputs` through `f`, one operation at a time.
///
/// Step *i* calls `f(acc, inputs[i])` to obtain the step's
/// specification; on success the step's result becomes the new
/// accumulator. The compound completes with the final accumulator, or
/// with `init` when `inputs` is empty. A failing step short-circuits
/// with its reason, like any sequence.
pub fn reduce<F>(
    f: F,
    init: impl Into<Value>,
    inputs: impl IntoIterator<Item = impl Into<Value>>,
) -> FsmSpec
where
    F: Fn(&Value, &Value) -> Result<FsmSpec, StepError> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let mut builder = SequenceBuilder::named("reduce").seed(ACC, init);
    for (i, input) in inputs.into_iter().enumerate() {
        let f = Arc::clone(&f);
        let input = input.into();
        builder = builder.step(
            Pattern::name(ACC),
            format!("reduce[{i}]"),
            move |env: &Env| f(&env.lookup(ACC), &input),
        );
    }
    builder.result_of(ACC)
}
