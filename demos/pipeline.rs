//! A small build-and-publish pipeline: fan out two fetches, fold their
//! sizes, and guard the slow step with a timeout.
//!
//! Run with `cargo run --example pipeline`.

use std::time::Duration;

use fsmop::prelude::*;

#[tokio::main]
async fn main() {
    env_logger::init();

    let fetch = |name: &str, size: i64| {
        let name = name.to_owned();
        dofsm! { fetch_one,
            _ <= delay(50, TimeUnit::Millis);
            body <= result((name.as_str(), size));
            => body
        }
    };

    let spec = dofsm! { publish,
        bodies <= parallel([fetch("left", 70), fetch("right", 30)]);
        total <= result(
            bodies
                .as_list()
                .map(|pairs| {
                    pairs
                        .iter()
                        .filter_map(|pair| pair.as_list()?.get(1)?.as_int())
                        .sum::<i64>()
                })
                .unwrap_or(0)
        );
        _ <= timeout(delay(100, TimeUnit::Millis), 1, TimeUnit::Secs);
        => total
    };

    let op = operate(spec);

    // Observe the pipeline mid-flight.
    println!("{}", report_operation(&op, &ReportOptions::default()));

    match op.wait_timeout(Duration::from_secs(5)).await {
        Some(Outcome::Completed(total)) => println!("published {total} bytes"),
        Some(Outcome::Failed(reason)) => eprintln!("pipeline failed: {reason}"),
        None => eprintln!("pipeline still running; giving up"),
    }

    let done = ReportOptions {
        show_env: true,
        show_history: true,
        ..ReportOptions::default()
    };
    println!("{}", report_operation(&op, &done));
}
