//! DEPENDENCIES executor: proposes libraries before the user approves a set.

use super::{ArtifactSet, DocumentPlan, ExecutorKind, GeneratedDocument, ProjectContext};
use crate::errors::ExecutorError;
use crate::llm::{LlmClient, ResponseFormat};
use crate::phase::LlmParams;

const SYSTEM: &str = "You are a staff engineer choosing third-party dependencies. You prefer \
mature, maintained libraries and you justify every addition.";

pub(crate) const PLANS: &[DocumentPlan] = &[DocumentPlan {
    name: "dependency-proposal.md",
    format: ResponseFormat::Markdown,
    system: SYSTEM,
    instructions: "Propose the dependency set for the approved stack. Group packages by \
concern (framework, data access, validation, testing, tooling). For each give the package \
name, a version range and one line on why it is needed. End with the packages you \
deliberately left out.",
    context: &["architecture.md", "stack-decision.md", "prd.md"],
}];

pub async fn run(
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    super::draft_documents(ExecutorKind::DependencyPlanner, llm, params, ctx, prior, PLANS).await
}
