use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepweave_core::repository::SnapshotStore;

use crate::state::AppState;

/// List suspended runs awaiting resume.
pub async fn handle_snapshots(state: &AppState, json: bool) -> anyhow::Result<()> {
    let snapshots = state.store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!();
        println!("  No suspended runs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Execution").fg(Color::White),
        Cell::new("Flow").fg(Color::White),
        Cell::new("Next Step").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
        Cell::new("Suspended").fg(Color::White),
    ]);

    for snapshot in &snapshots {
        table.add_row(vec![
            Cell::new(snapshot.execution_id).fg(Color::Cyan),
            Cell::new(&snapshot.flow_name),
            Cell::new(snapshot.resume_from_step_index),
            Cell::new(&snapshot.reason),
            Cell::new(snapshot.suspended_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {} suspended run{}",
        style(snapshots.len()).bold(),
        if snapshots.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}
