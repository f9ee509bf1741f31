//! SPEC executor, first step: product requirements and the API contract.
//!
//! Its output is handed to the architect in the same phase.

use super::{ArtifactSet, DocumentPlan, ExecutorKind, GeneratedDocument, ProjectContext};
use crate::errors::ExecutorError;
use crate::llm::{LlmClient, ResponseFormat};
use crate::phase::LlmParams;

const SYSTEM: &str = "You are an experienced product manager. You write requirements that \
engineers can implement and testers can verify. Every requirement gets an identifier.";

pub(crate) const PLANS: &[DocumentPlan] = &[
    DocumentPlan {
        name: "prd.md",
        format: ResponseFormat::Markdown,
        system: SYSTEM,
        instructions: "Write the product requirements document: overview, personas, \
functional requirements (FR-n) with acceptance criteria, non-functional requirements (NFR-n), \
and release scope. Stay consistent with the brief, the constitution and the approved stack.",
        context: &["project-brief.md", "constitution.md", "stack-decision.md"],
    },
    DocumentPlan {
        name: "api-spec.json",
        format: ResponseFormat::Json,
        system: SYSTEM,
        instructions: "Produce the HTTP API contract as a JSON object with an `endpoints` \
array. Each endpoint has `method`, `path`, `summary`, `request` and `response` fields and \
lists the requirement identifiers it satisfies in `requirements`.",
        context: &["prd.md"],
    },
];

pub async fn run(
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    super::draft_documents(ExecutorKind::ProductManager, llm, params, ctx, prior, PLANS).await
}
