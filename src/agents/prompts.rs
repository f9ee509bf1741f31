//! Prompt assembly shared by every executor.

use std::fmt::Write;

use super::{ArtifactSet, DocumentPlan, ProjectContext};
use crate::llm::ResponseFormat;

/// Longest excerpt of a prior document quoted into a prompt.
const MAX_QUOTED_CHARS: usize = 12_000;

pub(crate) fn render(ctx: &ProjectContext, working: &ArtifactSet, plan: &DocumentPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Write {}", plan.name);
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", plan.instructions.trim());
    let _ = writeln!(out);

    let _ = writeln!(out, "## Project");
    let _ = writeln!(out, "- Name: {}", ctx.name);
    let _ = writeln!(out, "- Slug: {}", ctx.slug);
    if ctx.description.trim().is_empty() {
        let _ = writeln!(out, "- Description: (none provided)");
    } else {
        let _ = writeln!(out, "- Description: {}", ctx.description.trim());
    }

    if let Some(stack) = &ctx.stack {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Approved stack");
        let _ = writeln!(out, "- Frontend: {}", stack.frontend);
        let _ = writeln!(out, "- Backend: {}", stack.backend);
        let _ = writeln!(out, "- Database: {}", stack.database);
        let _ = writeln!(out, "- Deployment: {}", stack.deployment);
        if let Some(pattern) = &stack.architecture_pattern {
            let _ = writeln!(out, "- Architecture pattern: {}", pattern);
        }
    }

    if let Some(deps) = &ctx.dependencies {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Approved dependencies");
        for package in &deps.packages {
            match &package.version {
                Some(version) => {
                    let _ = writeln!(out, "- {} {}", package.name, version);
                }
                None => {
                    let _ = writeln!(out, "- {}", package.name);
                }
            }
        }
    }

    let quoted: Vec<_> = plan
        .context
        .iter()
        .filter_map(|name| working.get(name))
        .collect();
    if !quoted.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Existing documents");
        for doc in quoted {
            let _ = writeln!(out);
            let _ = writeln!(out, "### {}", doc.name);
            let _ = writeln!(out, "{}", excerpt(&doc.content));
        }
    }

    let _ = writeln!(out);
    match plan.format {
        ResponseFormat::Markdown => {
            let _ = writeln!(
                out,
                "Respond with the Markdown document only, starting with a `#` heading."
            );
        }
        ResponseFormat::Json => {
            let _ = writeln!(
                out,
                "Respond with a single JSON object only. No prose, no code fences."
            );
        }
    }
    out
}

fn excerpt(content: &str) -> String {
    if content.chars().count() <= MAX_QUOTED_CHARS {
        return content.trim_end().to_string();
    }
    let cut: String = content.chars().take(MAX_QUOTED_CHARS).collect();
    format!("{}\n\n[... truncated ...]", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::GeneratedDocument;
    use crate::approval::StackSelection;

    const PLAN: DocumentPlan = DocumentPlan {
        name: "architecture.md",
        format: ResponseFormat::Markdown,
        system: "sys",
        instructions: "Describe the architecture.",
        context: &["prd.md", "missing.md"],
    };

    fn ctx() -> ProjectContext {
        ProjectContext {
            project_id: 7,
            slug: "shop".into(),
            name: "Shop".into(),
            description: "".into(),
            stack: Some(StackSelection {
                source: "preset".into(),
                preset_id: Some("react-node-postgres".into()),
                label: "React + Node".into(),
                frontend: "React".into(),
                backend: "Node.js".into(),
                database: "PostgreSQL".into(),
                deployment: "Docker".into(),
                architecture_pattern: Some("Layered monolith".into()),
                notes: None,
            }),
            dependencies: None,
        }
    }

    #[test]
    fn test_render_includes_project_stack_and_context_docs() {
        let mut working = ArtifactSet::new();
        working.insert(GeneratedDocument::new("prd.md", "# PRD\nCheckout flow"));
        working.insert(GeneratedDocument::new("other.md", "# Other\nSECRET"));

        let prompt = render(&ctx(), &working, &PLAN);
        assert!(prompt.starts_with("# Write architecture.md"));
        assert!(prompt.contains("- Name: Shop"));
        assert!(prompt.contains("(none provided)"));
        assert!(prompt.contains("- Backend: Node.js"));
        assert!(prompt.contains("Layered monolith"));
        assert!(prompt.contains("### prd.md"));
        assert!(prompt.contains("Checkout flow"));
        assert!(!prompt.contains("SECRET"), "only listed documents are quoted");
        assert!(!prompt.contains("missing.md"));
    }

    #[test]
    fn test_excerpt_truncates_long_documents() {
        let long = "x".repeat(MAX_QUOTED_CHARS + 10);
        let out = excerpt(&long);
        assert!(out.ends_with("[... truncated ...]"));
    }
}
