//! Environment and phase-spec inspection: `specflow check-env`, `specflow phases`.

use std::path::PathBuf;

use anyhow::Result;
use specflow::phase::PhaseSpec;

use super::load_config;

pub fn cmd_check_env() -> Result<()> {
    let config = load_config()?;
    println!("Environment OK");
    println!();
    for (key, value) in config.summary() {
        println!("  {:<26} {}", key, value);
    }
    Ok(())
}

/// Print the phase specification in effect. Only `PHASE_SPEC_PATH` is read,
/// so this works without a full environment.
pub fn cmd_phases() -> Result<()> {
    let path = std::env::var("PHASE_SPEC_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from);
    let spec = PhaseSpec::load_or_builtin(path.as_deref())?;

    println!(
        "Model: {} (temperature {}, max tokens {})",
        spec.llm.model, spec.llm.temperature, spec.llm.max_tokens
    );
    println!();
    for (i, def) in spec.phases.iter().enumerate() {
        println!("{}. {}  {}", i + 1, def.phase, def.description);
        if !def.executors.is_empty() {
            let executors: Vec<&str> = def.executors.iter().map(|e| e.as_str()).collect();
            println!("     executors: {}", executors.join(", "));
        }
        if !def.artifacts.is_empty() {
            let artifacts: Vec<&str> = def.artifacts.iter().map(|a| a.name.as_str()).collect();
            println!("     artifacts: {}", artifacts.join(", "));
        }
        if let Some(kind) = def.approval {
            println!("     approval:  {}", kind);
        }
    }
    Ok(())
}
