//! Agent executors.
//!
//! Each executor is a pure async function
//! `(llm, params, project context, prior artifacts) -> documents`.
//! Everything an executor reads arrives as an argument: there is no executor
//! struct, no cached client and no state carried between invocations. The
//! project context is an immutable snapshot taken by the orchestrator before
//! the first executor of a phase runs.
//!
//! | Executor             | Phase        | Documents                        |
//! |----------------------|--------------|----------------------------------|
//! | `analyst`            | ANALYSIS     | project-brief.md, constitution.md|
//! | `product_manager`    | SPEC         | prd.md, api-spec.json            |
//! | `architect`          | SPEC         | architecture.md                  |
//! | `dependency_planner` | DEPENDENCIES | dependency-proposal.md           |
//! | `solution_architect` | SOLUTIONING  | epics.md, tasks.md               |

pub mod analyst;
pub mod architect;
pub mod dependency_planner;
pub mod product_manager;
mod prompts;
pub mod solution_architect;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::approval::{DependencySelection, StackSelection};
use crate::errors::ExecutorError;
use crate::llm::{CompletionRequest, LlmClient, ResponseFormat};
use crate::phase::LlmParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Analyst,
    ProductManager,
    Architect,
    DependencyPlanner,
    SolutionArchitect,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 5] = [
        ExecutorKind::Analyst,
        ExecutorKind::ProductManager,
        ExecutorKind::Architect,
        ExecutorKind::DependencyPlanner,
        ExecutorKind::SolutionArchitect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::ProductManager => "product_manager",
            Self::Architect => "architect",
            Self::DependencyPlanner => "dependency_planner",
            Self::SolutionArchitect => "solution_architect",
        }
    }

    /// Names of the documents this executor writes, in generation order.
    pub fn documents(&self) -> Vec<&'static str> {
        self.plans().iter().map(|p| p.name).collect()
    }

    fn plans(&self) -> &'static [DocumentPlan] {
        match self {
            Self::Analyst => analyst::PLANS,
            Self::ProductManager => product_manager::PLANS,
            Self::Architect => architect::PLANS,
            Self::DependencyPlanner => dependency_planner::PLANS,
            Self::SolutionArchitect => solution_architect::PLANS,
        }
    }

    /// Run this executor.
    pub async fn execute(
        self,
        llm: &dyn LlmClient,
        params: &LlmParams,
        ctx: &ProjectContext,
        prior: &ArtifactSet,
    ) -> Result<Vec<GeneratedDocument>, ExecutorError> {
        match self {
            Self::Analyst => analyst::run(llm, params, ctx, prior).await,
            Self::ProductManager => product_manager::run(llm, params, ctx, prior).await,
            Self::Architect => architect::run(llm, params, ctx, prior).await,
            Self::DependencyPlanner => dependency_planner::run(llm, params, ctx, prior).await,
            Self::SolutionArchitect => solution_architect::run(llm, params, ctx, prior).await,
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown executor '{}'", s))
    }
}

/// Immutable snapshot of the project an executor works on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectContext {
    pub project_id: i64,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub stack: Option<StackSelection>,
    pub dependencies: Option<DependencySelection>,
}

/// A named document, either generated in this run or loaded from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub name: String,
    pub content: String,
}

impl GeneratedDocument {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Ordered set of documents keyed by name. Inserting a name that is
/// already present replaces the earlier content in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    docs: Vec<GeneratedDocument>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&GeneratedDocument> {
        self.docs.iter().find(|d| d.name == name)
    }

    pub fn insert(&mut self, doc: GeneratedDocument) {
        match self.docs.iter_mut().find(|d| d.name == doc.name) {
            Some(existing) => *existing = doc,
            None => self.docs.push(doc),
        }
    }

    pub fn extend(&mut self, docs: impl IntoIterator<Item = GeneratedDocument>) {
        for doc in docs {
            self.insert(doc);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneratedDocument> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn into_documents(self) -> Vec<GeneratedDocument> {
        self.docs
    }
}

impl FromIterator<GeneratedDocument> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = GeneratedDocument>>(iter: I) -> Self {
        let mut set = ArtifactSet::new();
        set.extend(iter);
        set
    }
}

/// One LLM call producing one document.
pub(crate) struct DocumentPlan {
    pub name: &'static str,
    pub format: ResponseFormat,
    pub system: &'static str,
    pub instructions: &'static str,
    /// Earlier documents quoted into the prompt, when available.
    pub context: &'static [&'static str],
}

/// Generate `plans` in order. Each document can see the ones generated
/// before it through the working set.
pub(crate) async fn draft_documents(
    kind: ExecutorKind,
    llm: &dyn LlmClient,
    params: &LlmParams,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
    plans: &[DocumentPlan],
) -> Result<Vec<GeneratedDocument>, ExecutorError> {
    let mut working = prior.clone();
    let mut produced = Vec::with_capacity(plans.len());

    for plan in plans {
        let prompt = prompts::render(ctx, &working, plan);
        let request = CompletionRequest::new(params, plan.system, prompt, plan.format);
        let completion = llm
            .complete(request)
            .await
            .map_err(|source| ExecutorError::Llm {
                executor: kind,
                document: plan.name.to_string(),
                source,
            })?;

        let content = finalize(plan.format, &completion.text).map_err(|message| {
            ExecutorError::InvalidOutput {
                executor: kind,
                document: plan.name.to_string(),
                message,
            }
        })?;

        tracing::debug!(
            executor = %kind,
            document = plan.name,
            project = %ctx.slug,
            bytes = content.len(),
            "Document generated"
        );

        let doc = GeneratedDocument::new(plan.name, content);
        working.insert(doc.clone());
        produced.push(doc);
    }

    Ok(produced)
}

/// Normalise raw model output into the stored document body.
fn finalize(format: ResponseFormat, raw: &str) -> Result<String, String> {
    match format {
        ResponseFormat::Json => {
            let json = extract_json(raw)?;
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())
        }
        ResponseFormat::Markdown => {
            let body = strip_fence(raw).trim();
            if body.is_empty() {
                return Err("empty document".to_string());
            }
            Ok(format!("{}\n", body))
        }
    }
}

/// Take the outermost `{ ... }` span and parse it. Models like to wrap JSON
/// in prose or code fences.
fn extract_json(raw: &str) -> Result<serde_json::Value, String> {
    let start = raw.find('{').ok_or("no JSON object in response")?;
    let end = raw.rfind('}').ok_or("no JSON object in response")?;
    if end < start {
        return Err("no JSON object in response".to_string());
    }
    serde_json::from_str(&raw[start..=end]).map_err(|e| format!("invalid JSON: {}", e))
}

/// Remove a single code fence wrapping the whole reply.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```")
        && let Some(body) = rest.strip_suffix("```")
    {
        // Drop the info string (```markdown) on the opening line.
        return match body.find('\n') {
            Some(idx) => &body[idx + 1..],
            None => body,
        };
    }
    trimmed
}
