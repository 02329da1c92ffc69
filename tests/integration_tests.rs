use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fsmop::prelude::*;

#[tokio::test]
async fn sequence_of_succeed_completes_with_null() {
    let spec = dofsm! { s,
        _ <= succeed();
        => ()
    };
    let op = operate(spec);
    assert_eq!(op.wait().await, Outcome::Completed(Value::Null));
}

#[tokio::test]
async fn sequence_of_fail_propagates_the_reason() {
    let spec = dofsm! { s,
        _ <= fail("bad");
        => ()
    };
    let op = operate(spec);
    assert_eq!(
        op.wait().await,
        Outcome::Failed(FailReason::Value(Value::Str("bad".into())))
    );
}

#[tokio::test]
async fn rebinding_threads_through_steps() {
    let spec = dofsm! { s,
        x <= result(1);
        x <= result(x.as_int().unwrap_or(0) + 2);
        => x
    };
    let op = operate(spec);
    assert_eq!(op.wait().await, Outcome::Completed(Value::Int(3)));
}

#[tokio::test(start_paused = true)]
async fn delay_step_takes_its_time() {
    let spec = dofsm! { s,
        _ <= delay(1000, TimeUnit::Millis);
        => ()
    };
    let started = tokio::time::Instant::now();
    let op = operate(spec);
    let outcome = op.wait().await;
    let elapsed = started.elapsed();
    assert_eq!(outcome, Outcome::Completed(Value::Null));
    assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1500), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn timed_out_step_fails_early() {
    let spec = dofsm! { s,
        _ <= timeout(delay(1000, TimeUnit::Millis), 500, TimeUnit::Millis);
        => ()
    };
    let started = tokio::time::Instant::now();
    let op = operate(spec);
    let outcome = op.wait().await;
    let elapsed = started.elapsed();
    assert_eq!(outcome, Outcome::Failed(FailReason::TimedOut));
    assert!(elapsed <= Duration::from_millis(900), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn parallel_results_arrive_in_input_order() {
    let op = operate(parallel([result(1), result(1), result(1)]));
    assert_eq!(
        op.wait().await,
        Outcome::Completed(Value::List(vec![
            Value::Int(1),
            Value::Int(1),
            Value::Int(1)
        ]))
    );
}

#[tokio::test]
async fn parallel_failure_collects_child_reasons() {
    let op = operate(parallel([result(1), fail("because")]));
    assert_eq!(
        op.wait().await,
        Outcome::Failed(FailReason::FailedOps(vec![FailReason::Value(Value::Str(
            "because".into()
        ))]))
    );
}

#[tokio::test]
async fn reduce_folds_left_to_right() {
    let op = operate(reduce(
        |acc: &Value, v: &Value| Ok(result(acc.as_int().unwrap_or(0) + v.as_int().unwrap_or(0))),
        0,
        [1, 2, 3],
    ));
    assert_eq!(op.wait().await, Outcome::Completed(Value::Int(6)));
}

#[tokio::test]
async fn nested_sequence_failure_propagates_two_levels() {
    let inner = dofsm! { inner,
        y <= fail("r");
        => y
    };
    let outer = SequenceBuilder::named("outer")
        .step(Pattern::name("x"), "inner", move |_: &Env| Ok(inner.clone()))
        .result_of("x");
    let op = operate(outer);
    assert_eq!(
        op.wait().await,
        Outcome::Failed(FailReason::Value(Value::Str("r".into())))
    );
}

// --- invariants ---

#[tokio::test(start_paused = true)]
async fn every_operation_settles_in_exactly_one_terminal_state() {
    let specs = vec![
        result(1),
        fail("x"),
        succeed(),
        delay(10, TimeUnit::Millis),
        parallel([result(1), fail("y")]),
        timeout(delay(100, TimeUnit::Millis), 10, TimeUnit::Millis),
        reduce(|_: &Value, _: &Value| Ok(succeed()), 0, [1, 2]),
    ];
    for spec in specs {
        let op = operate(spec);
        op.wait().await;
        let status = op.status();
        assert!(status.state.is_terminal(), "stuck in {}", status.state);
        assert!(!op.is_running());
    }
}

#[tokio::test]
async fn specifications_are_reusable_values() {
    let spec = dofsm! { twice,
        x <= result(21);
        => x
    };
    let first = operate(spec.clone());
    let second = operate(spec);
    assert_eq!(first.wait().await, Outcome::Completed(Value::Int(21)));
    assert_eq!(second.wait().await, Outcome::Completed(Value::Int(21)));
}

#[tokio::test(start_paused = true)]
async fn parallel_preserves_order_under_scrambled_completion() {
    let op = operate(parallel([
        delay(500, TimeUnit::Millis),
        result(2),
        delay(100, TimeUnit::Millis),
        result(4),
    ]));
    assert_eq!(
        op.wait().await,
        Outcome::Completed(Value::List(vec![
            Value::Null,
            Value::Int(2),
            Value::Null,
            Value::Int(4)
        ]))
    );
}

#[tokio::test]
async fn binding_visibility_follows_source_order() {
    let spec = dofsm! { vis,
        x <= result(7);
        y <= result(x.as_int().unwrap_or(0) * 3);
        => (x, y)
    };
    let op = operate(spec);
    assert_eq!(
        op.wait().await,
        Outcome::Completed(Value::List(vec![Value::Int(7), Value::Int(21)]))
    );
}

#[tokio::test]
async fn failure_skips_the_remaining_steps() {
    let constructed = Arc::new(AtomicUsize::new(0));
    let (c1, c2, c3) = (
        Arc::clone(&constructed),
        Arc::clone(&constructed),
        Arc::clone(&constructed),
    );
    let spec = SequenceBuilder::named("short")
        .step(Pattern::Ignore, "ok", move |_: &Env| {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(succeed())
        })
        .step(Pattern::Ignore, "boom", move |_: &Env| {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(fail("r"))
        })
        .step(Pattern::Ignore, "never", move |_: &Env| {
            c3.fetch_add(1, Ordering::SeqCst);
            Ok(succeed())
        })
        .result(|_| Ok(Value::Null));
    let op = operate(spec);
    assert_eq!(
        op.wait().await,
        Outcome::Failed(FailReason::Value(Value::Str("r".into())))
    );
    assert_eq!(constructed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_budget_cuts_both_ways() {
    let tight = operate(timeout(delay(100, TimeUnit::Millis), 50, TimeUnit::Millis));
    assert_eq!(tight.wait().await, Outcome::Failed(FailReason::TimedOut));

    let loose = operate(timeout(delay(100, TimeUnit::Millis), 200, TimeUnit::Millis));
    assert_eq!(loose.wait().await, Outcome::Completed(Value::Null));
}

#[tokio::test]
async fn empty_compounds_have_defined_results() {
    let par = operate(parallel([]));
    assert_eq!(par.wait().await, Outcome::Completed(Value::Null));

    let red = operate(reduce(
        |_: &Value, _: &Value| Ok(succeed()),
        5,
        Vec::<i64>::new(),
    ));
    assert_eq!(red.wait().await, Outcome::Completed(Value::Int(5)));
}

#[tokio::test(start_paused = true)]
async fn abort_terminates_a_running_sequence() {
    let spec = dofsm! { long,
        _ <= delay(60, TimeUnit::Secs);
        _ <= delay(60, TimeUnit::Secs);
        => ()
    };
    let op = operate(spec);
    op.abort();
    let outcome = op
        .wait_timeout(Duration::from_secs(5))
        .await
        .expect("abort must settle the operation");
    assert!(
        matches!(outcome, Outcome::Failed(FailReason::Aborted(_))),
        "unexpected outcome {outcome:?}"
    );
    assert!(op.status().state.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn abort_reason_is_carried_to_the_caller() {
    let spec = dofsm! { reasoned,
        _ <= delay(60, TimeUnit::Secs);
        => ()
    };
    let op = operate(spec);
    op.abort_with("operator-request");
    let outcome = op.wait().await;
    assert_eq!(
        outcome,
        Outcome::Failed(FailReason::Aborted(Value::Str("operator-request".into())))
    );
}

#[tokio::test]
async fn nested_parallel_failure_has_depth_two() {
    let inner = || parallel([result(1), fail("nok")]);
    let op = operate(parallel([inner(), inner(), inner()]));
    let Outcome::Failed(FailReason::FailedOps(outer)) = op.wait().await else {
        panic!("expected failed-ops");
    };
    assert_eq!(outer.len(), 3);
    for reason in outer {
        assert_eq!(
            reason,
            FailReason::FailedOps(vec![FailReason::Value(Value::Str("nok".into()))])
        );
    }
}

#[tokio::test]
async fn sequence_can_drive_a_parallel_step() {
    let spec = dofsm! { fan_out,
        sizes <= parallel([result(2), result(3)]);
        total <= result(
            sizes
                .as_list()
                .map(|items| items.iter().filter_map(Value::as_int).sum::<i64>())
                .unwrap_or(0)
        );
        => total
    };
    let op = operate(spec);
    assert_eq!(op.wait().await, Outcome::Completed(Value::Int(5)));
}
