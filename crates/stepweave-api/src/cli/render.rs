//! Terminal rendering shared by the run and resume commands.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use stepweave_core::flow::{RunFailure, RunResult};
use stepweave_types::metrics::{RunMetrics, StepMetric};
use stepweave_types::snapshot::SuspendedExecutionState;

/// Per-step metrics table.
pub fn metrics_table(metrics: &RunMetrics) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Step").fg(Color::White),
        Cell::new("Runner").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Duration").fg(Color::White),
    ]);

    for metric in &metrics.steps {
        let (label, color) = status(metric);
        table.add_row(vec![
            Cell::new(&metric.step).fg(Color::Cyan),
            Cell::new(&metric.runner),
            Cell::new(label).fg(color),
            Cell::new(metric.attempts),
            Cell::new(format!("{}ms", metric.duration_ms)).fg(Color::DarkGrey),
        ]);
    }
    table
}

fn status(metric: &StepMetric) -> (&'static str, Color) {
    if metric.skipped {
        ("skipped", Color::DarkGrey)
    } else if metric.cache_hit {
        ("cached", Color::Blue)
    } else if !metric.success {
        if metric.timed_out {
            ("timed out", Color::Red)
        } else {
            ("failed", Color::Red)
        }
    } else if metric.error.is_some() {
        ("flagged", Color::Yellow)
    } else {
        ("ok", Color::Green)
    }
}

pub fn print_completed(result: &RunResult, json: bool) -> anyhow::Result<()> {
    if json {
        let out = json!({
            "status": "completed",
            "executionId": result.execution_id,
            "output": result.output,
            "metrics": result.metrics,
            "state": result.state_report,
            "scoring": result.scoring,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {} completed",
        style("*").green().bold(),
        style(result.execution_id).cyan()
    );
    println!("{}", metrics_table(&result.metrics));
    println!("  {}", style(result.metrics.summary()).dim());
    if let Some(score) = result.scoring.as_ref().and_then(|s| s.final_score) {
        println!("  Final score: {score:.2}");
    }
    println!();
    println!("{}", pretty(&result.output)?);
    Ok(())
}

pub fn print_suspended(snapshot: &SuspendedExecutionState, json: bool) -> anyhow::Result<()> {
    if json {
        let out = json!({
            "status": "suspended",
            "executionId": snapshot.execution_id,
            "resumeFromStepIndex": snapshot.resume_from_step_index,
            "reason": snapshot.reason,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Run {} suspended before step {}: {}",
        style("||").yellow().bold(),
        style(snapshot.execution_id).cyan(),
        snapshot.resume_from_step_index,
        snapshot.reason
    );
    println!("{}", metrics_table(&snapshot.metrics_snapshot));
    println!(
        "  Resume with: stepweave resume {} --input '<json>'",
        snapshot.execution_id
    );
    println!();
    Ok(())
}

pub fn print_failure(failure: &RunFailure, json: bool) -> anyhow::Result<()> {
    if json {
        let out = json!({
            "status": "failed",
            "executionId": failure.execution_id,
            "error": failure.error.to_string(),
            "kind": failure.error.kind(),
            "failedStep": failure.failed_step,
            "failedIndex": failure.failed_index,
            "bestOutput": failure.error.best_output(),
            "metrics": failure.metrics,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    eprintln!();
    eprintln!("  {} {}", style("x").red().bold(), failure);
    if let Some(best) = failure.error.best_output() {
        eprintln!("  Best attempt output: {}", pretty(best)?);
    }
    if !failure.metrics.steps.is_empty() {
        eprintln!("{}", metrics_table(&failure.metrics));
    }
    eprintln!();
    Ok(())
}

fn pretty(value: &Value) -> serde_json::Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        other => serde_json::to_string_pretty(other),
    }
}
