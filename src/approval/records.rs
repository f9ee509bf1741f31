//! Decision and rationale documents written on approval.

use std::fmt::Write;

use super::{DependencySelection, StackSelection};

pub const STACK_DECISION: &str = "stack-decision.md";
pub const STACK_RATIONALE: &str = "stack-rationale.md";
pub const DEPENDENCIES_MANIFEST: &str = "dependencies.json";
pub const DEPENDENCY_RATIONALE: &str = "dependency-rationale.md";

pub fn stack_decision(project: &str, stack: &StackSelection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Stack Decision: {}", project);
    let _ = writeln!(out);
    let _ = writeln!(out, "**Selection:** {}", stack.label);
    let _ = writeln!(out, "**Source:** {}", source_line(&stack.source, stack.preset_id.as_deref()));
    let _ = writeln!(out);
    let _ = writeln!(out, "| Layer | Choice |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Frontend | {} |", stack.frontend);
    let _ = writeln!(out, "| Backend | {} |", stack.backend);
    let _ = writeln!(out, "| Database | {} |", stack.database);
    let _ = writeln!(out, "| Deployment | {} |", stack.deployment);
    if let Some(pattern) = &stack.architecture_pattern {
        let _ = writeln!(out, "| Architecture pattern | {} |", pattern);
    }
    out
}

pub fn stack_rationale(project: &str, stack: &StackSelection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Stack Rationale: {}", project);
    let _ = writeln!(out);
    match stack.preset_id.as_deref() {
        Some(id) => {
            let _ = writeln!(
                out,
                "The `{}` preset was approved as the technology stack for this project.",
                id
            );
        }
        None => {
            let _ = writeln!(
                out,
                "A custom technology stack was approved for this project."
            );
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## Notes");
    let _ = writeln!(out);
    match stack.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(notes) => {
            let _ = writeln!(out, "{}", notes);
        }
        None => {
            let _ = writeln!(out, "No additional notes were provided.");
        }
    }
    out
}

/// Machine-readable manifest of the approved packages.
pub fn dependencies_manifest(deps: &DependencySelection) -> String {
    let value = serde_json::json!({
        "source": deps.source,
        "preset_id": deps.preset_id,
        "label": deps.label,
        "packages": deps.packages,
    });
    let mut out = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    out.push('\n');
    out
}

pub fn dependency_rationale(project: &str, deps: &DependencySelection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Dependency Rationale: {}", project);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "**Selection:** {} ({})",
        deps.label,
        source_line(&deps.source, deps.preset_id.as_deref())
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "| Package | Version | Ecosystem | Purpose |");
    let _ = writeln!(out, "|---|---|---|---|");
    for package in &deps.packages {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            package.name,
            package.version.as_deref().unwrap_or("latest"),
            package.ecosystem.as_deref().unwrap_or("-"),
            package.purpose.as_deref().unwrap_or("-"),
        );
    }
    if let Some(notes) = deps.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Notes");
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", notes);
    }
    out
}

fn source_line(source: &str, preset_id: Option<&str>) -> String {
    match preset_id {
        Some(id) => format!("{} `{}`", source, id),
        None => source.to_string(),
    }
}
