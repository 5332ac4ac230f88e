//! Live step progress printed from the event bus.

use console::style;
use stepweave_types::event::FlowEvent;
use tokio::sync::broadcast;

/// Print step lifecycle events to stderr until the bus closes.
pub fn spawn_printer(mut rx: broadcast::Receiver<FlowEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = progress_line(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn progress_line(event: &FlowEvent) -> Option<String> {
    let line = match event {
        FlowEvent::StepStarted { step, runner, .. } => {
            format!("  {} {} ({})", style("->").dim(), style(step).cyan(), runner)
        }
        FlowEvent::StepCompleted {
            step,
            duration_ms,
            cache_hit,
            ..
        } => {
            let cached = if *cache_hit { " cached" } else { "" };
            format!(
                "  {} {} {}ms{}",
                style("ok").green(),
                style(step).cyan(),
                duration_ms,
                cached
            )
        }
        FlowEvent::StepFailed {
            step,
            error,
            will_retry,
            ..
        } => {
            let label = if *will_retry { "retry" } else { "fail" };
            format!("  {} {}: {}", style(label).red(), style(step).cyan(), error)
        }
        _ => return None,
    };
    Some(line)
}
