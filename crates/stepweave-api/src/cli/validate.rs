use std::path::Path;

use anyhow::Context;
use console::style;
use serde_json::json;
use stepweave_infra::flow_file::load_flow_file;

/// Parse and validate a flow file without running it.
pub fn handle_validate(flow_path: &Path, json: bool) -> anyhow::Result<()> {
    let flow = load_flow_file(flow_path)
        .with_context(|| format!("Invalid flow {}", flow_path.display()))?;

    if json {
        let out = json!({
            "valid": true,
            "name": flow.name,
            "steps": flow.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "  {} {} is valid ({} top-level step{})",
        style("ok").green().bold(),
        style(&flow.name).cyan(),
        flow.steps.len(),
        if flow.steps.len() == 1 { "" } else { "s" }
    );
    Ok(())
}
