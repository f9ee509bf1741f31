//! SOLUTIONING executor: turns the specification into deliverable work.

use super::{ArtifactSet, DocumentPlan, ExecutorKind, GeneratedDocument, ProjectContext};
use crate::errors::ExecutorError;
use crate::llm::{LlmClient, ResponseFormat};
use crate::phase::LlmParams;

const SYSTEM: &str = "You are a delivery lead. You slice a specified system into epics and \
small, independently testable tasks that reference the requirements they implement.";

pub(crate) const PLANS: &[DocumentPlan] = &[
    DocumentPlan {
        name: "epics.md",
        format: ResponseFormat::Markdown,
        system: SYSTEM,
        instructions: "Write the epics: for each, a goal, the requirement identifiers it \
covers and its exit criteria. Order epics so each builds on the previous ones.",
        context: &["prd.md", "architecture.md", "dependencies.json"],
    },
    DocumentPlan {
        name: "tasks.md",
        format: ResponseFormat::Markdown,
        system: SYSTEM,
        instructions: "Break every epic into tasks. Each task has an identifier, the epic it \
belongs to, the files or components it touches, and a definition of done that includes tests.",
        context: &["epics.md", "architecture.md", "api-spec.json"],
    },
];

pub async fn run(
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    super::draft_documents(ExecutorKind::SolutionArchitect, llm, params, ctx, prior, PLANS).await
}
