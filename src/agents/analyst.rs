//! ANALYSIS executor: frames the problem before any technology is chosen.

use super::{ArtifactSet, DocumentPlan, ExecutorKind, GeneratedDocument, ProjectContext};
use crate::errors::ExecutorError;
use crate::llm::{LlmClient, ResponseFormat};
use crate::phase::LlmParams;

const SYSTEM: &str = "You are a senior business analyst. You turn a short project idea into \
clear, testable problem statements. You never pick technologies; that happens later.";

pub(crate) const PLANS: &[DocumentPlan] = &[
    DocumentPlan {
        name: "project-brief.md",
        format: ResponseFormat::Markdown,
        system: SYSTEM,
        instructions: "Write a project brief with these sections: Problem, Target users, \
Goals, Non-goals, Success metrics, Open questions. Keep each section concrete.",
        context: &[],
    },
    DocumentPlan {
        name: "constitution.md",
        format: ResponseFormat::Markdown,
        system: SYSTEM,
        instructions: "Write the project constitution: the numbered principles every later \
decision must respect (quality bar, testing expectations, security posture, scope \
discipline). Derive them from the brief.",
        context: &["project-brief.md"],
    },
];

pub async fn run(
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    super::draft_documents(ExecutorKind::Analyst, llm, params, ctx, prior, PLANS).await
}
