//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use crate::scheduler::Scheduler;

/// Collect all scheduler metrics and format as Prometheus text.
pub async fn collect_metrics(scheduler: &Scheduler) -> String {
    let mut output = String::new();

    collect_run_metrics(scheduler, &mut output).await;
    collect_dispatch_metrics(scheduler, &mut output).await;
    collect_cost_metrics(scheduler, &mut output).await;

    output
}

/// Tracked runs by status.
async fn collect_run_metrics(scheduler: &Scheduler, output: &mut String) {
    writeln!(
        output,
        "# HELP assessrun_runs_total Number of tracked runs by status"
    )
    .ok();
    writeln!(output, "# TYPE assessrun_runs_total gauge").ok();
    for (status, count) in scheduler.run_counts_by_status().await {
        writeln!(output, "assessrun_runs_total{{status=\"{status}\"}} {count}").ok();
    }
}

/// Queue depth and slot usage.
async fn collect_dispatch_metrics(scheduler: &Scheduler, output: &mut String) {
    let queued = scheduler.queue_depth().await;
    let active = scheduler.active_runs();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP assessrun_queue_depth Runs waiting for a dispatch slot"
    )
    .ok();
    writeln!(output, "# TYPE assessrun_queue_depth gauge").ok();
    writeln!(output, "assessrun_queue_depth {queued}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP assessrun_active_runs Runs currently holding a dispatch slot"
    )
    .ok();
    writeln!(output, "# TYPE assessrun_active_runs gauge").ok();
    writeln!(output, "assessrun_active_runs {active}").ok();
}

/// Ledger totals per currency.
async fn collect_cost_metrics(scheduler: &Scheduler, output: &mut String) {
    let totals = scheduler.ledger().totals_by_currency().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP assessrun_cost_total Recorded cost by currency"
    )
    .ok();
    writeln!(output, "# TYPE assessrun_cost_total counter").ok();
    for (currency, amount) in totals {
        writeln!(
            output,
            "assessrun_cost_total{{currency=\"{currency}\"}} {amount}"
        )
        .ok();
    }
}
