//! SPEC executor, second step: system architecture from the PM's output.

use super::{ArtifactSet, DocumentPlan, ExecutorKind, GeneratedDocument, ProjectContext};
use crate::errors::ExecutorError;
use crate::llm::{LlmClient, ResponseFormat};
use crate::phase::LlmParams;

const SYSTEM: &str = "You are a pragmatic software architect. You design the simplest system \
that meets the requirements on the approved stack, and you say which trade-offs you made.";

pub(crate) const PLANS: &[DocumentPlan] = &[DocumentPlan {
    name: "architecture.md",
    format: ResponseFormat::Markdown,
    system: SYSTEM,
    instructions: "Write the architecture document: context diagram (as a list), components \
and their responsibilities, data model, how each API endpoint is served, cross-cutting \
concerns (auth, logging, errors, configuration) and deployment topology.",
    context: &["prd.md", "api-spec.json", "stack-decision.md", "constitution.md"],
}];

pub async fn run(
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    super::draft_documents(ExecutorKind::Architect, llm, params, ctx, prior, PLANS).await
}
