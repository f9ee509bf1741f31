use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::guard::{ExecutionGuard, ExecutionPermit};
use crate::agents::{ArtifactSet, GeneratedDocument, ProjectContext};
use crate::approval::{decode_dependencies, decode_stack};
use crate::errors::OrchestratorError;
use crate::llm::LlmClient;
use crate::phase::{ApprovalKind, Phase, PhaseSpec};
use crate::store::{Artifact, ArtifactFiles, ArtifactSummary, DbHandle, NewArtifact, Project};

/// Result of one phase execution.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRun {
    pub project: String,
    pub phase: Phase,
    pub executors: Vec<String>,
    pub artifacts: Vec<ArtifactSummary>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub name: String,
    pub present: bool,
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Completed,
    Current,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub state: PhaseState,
    pub description: String,
    pub executors: Vec<String>,
    pub artifacts: Vec<ArtifactStatus>,
    pub approval: Option<ApprovalKind>,
    pub approved: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: String,
    pub current_phase: Phase,
    pub completed_phases: Vec<Phase>,
    pub can_advance: bool,
    pub blockers: Vec<String>,
    pub running: bool,
    pub phases: Vec<PhaseStatus>,
}

/// Runs executors for a project's current phase and moves projects between
/// phases. Holds no per-project state other than the execution guard; every
/// run works from a fresh snapshot read after the guard is taken.
#[derive(Clone)]
pub struct Orchestrator {
    db: DbHandle,
    files: ArtifactFiles,
    llm: Arc<dyn LlmClient>,
    spec: Arc<PhaseSpec>,
    guard: ExecutionGuard,
}

impl Orchestrator {
    pub fn new(db: DbHandle, files: ArtifactFiles, llm: Arc<dyn LlmClient>, spec: Arc<PhaseSpec>) -> Self {
        Self {
            db,
            files,
            llm,
            spec,
            guard: ExecutionGuard::new(),
        }
    }

    pub fn spec(&self) -> &PhaseSpec {
        &self.spec
    }

    /// Hold the project's execution guard. Anything that must not overlap a
    /// phase run (execution, advancing, deletion) claims it first.
    pub fn claim(&self, project: &Project) -> Result<ExecutionPermit, OrchestratorError> {
        self.guard
            .try_acquire(project.id)
            .ok_or_else(|| OrchestratorError::AlreadyRunning {
                slug: project.slug.clone(),
            })
    }

    /// Execute the executors registered for `phase_name`, which must be the
    /// project's current phase. Nothing is persisted unless every executor
    /// succeeds and every document validates.
    pub async fn execute_phase(
        &self,
        project: &Project,
        phase_name: &str,
    ) -> Result<PhaseRun, OrchestratorError> {
        let phase = Phase::from_str(phase_name)
            .map_err(|_| OrchestratorError::UnknownPhase(phase_name.to_string()))?;
        if self.spec.definition(phase).executors.is_empty() {
            return Err(OrchestratorError::NoExecutors(phase));
        }

        let _permit = self.claim(project)?;

        let (ctx, prior, current) = self.snapshot(project.id, &project.slug).await?;
        if current != phase {
            return Err(OrchestratorError::NotCurrentPhase {
                requested: phase,
                current,
            });
        }

        let started = Instant::now();
        tracing::info!(project = %ctx.slug, phase = %phase, "Executing phase");

        let documents = run_executors(self.llm.as_ref(), &self.spec, phase, &ctx, &prior).await?;

        let new_artifacts: Vec<NewArtifact> = documents
            .into_iter()
            .map(|doc| NewArtifact {
                phase,
                name: doc.name,
                content: doc.content,
            })
            .collect();
        let project_id = ctx.project_id;
        let stored = self
            .db
            .call(move |db| db.insert_artifacts(project_id, &new_artifacts))
            .await
            .map_err(OrchestratorError::Storage)?;

        self.files
            .write_artifacts(&ctx.slug, &stored)
            .await
            .map_err(OrchestratorError::Storage)?;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            project = %ctx.slug,
            phase = %phase,
            artifacts = stored.len(),
            duration_ms,
            "Phase execution complete"
        );

        Ok(PhaseRun {
            project: ctx.slug,
            phase,
            executors: self
                .spec
                .definition(phase)
                .executors
                .iter()
                .map(|e| e.to_string())
                .collect(),
            artifacts: stored.iter().map(|a| a.summary()).collect(),
            duration_ms,
        })
    }

    /// Immutable view of everything the executors may read.
    async fn snapshot(
        &self,
        project_id: i64,
        slug: &str,
    ) -> Result<(ProjectContext, ArtifactSet, Phase), OrchestratorError> {
        let slug = slug.to_string();
        let (project, artifacts, stack, deps) = self
            .db
            .call(move |db| {
                let project = db
                    .get_project(&slug)?
                    .ok_or_else(|| anyhow::anyhow!("Project {} not found", slug))?;
                let artifacts = db.latest_artifacts(project_id, None)?;
                let stack = db.latest_selection(project_id, ApprovalKind::Stack)?;
                let deps = db.latest_selection(project_id, ApprovalKind::Dependencies)?;
                Ok((project, artifacts, stack, deps))
            })
            .await
            .map_err(OrchestratorError::Storage)?;

        let stack = stack
            .map(|s| decode_stack(&s))
            .transpose()
            .map_err(|e| OrchestratorError::Storage(e.into()))?;
        let dependencies = deps
            .map(|s| decode_dependencies(&s))
            .transpose()
            .map_err(|e| OrchestratorError::Storage(e.into()))?;

        let prior: ArtifactSet = artifacts
            .into_iter()
            .map(|a| GeneratedDocument::new(a.name, a.content))
            .collect();
        let ctx = ProjectContext {
            project_id: project.id,
            slug: project.slug,
            name: project.name,
            description: project.description,
            stack,
            dependencies,
        };
        Ok((ctx, prior, project.current_phase))
    }

    /// Move the project to the successor of its current phase once every
    /// required artifact exists and the phase's approval, if any, is given.
    pub async fn advance(&self, project: &Project) -> Result<Project, OrchestratorError> {
        let _permit = self.claim(project)?;

        let spec = Arc::clone(&self.spec);
        let slug = project.slug.clone();
        let outcome = self
            .db
            .call(move |db| {
                let project = db
                    .get_project(&slug)?
                    .ok_or_else(|| anyhow::anyhow!("Project {} not found", slug))?;
                let phase = project.current_phase;
                if phase.is_terminal() {
                    return Ok(Err(OrchestratorError::Terminal(phase)));
                }
                let present = db.latest_artifacts(project.id, Some(phase))?;
                let (missing, approval) = blockers(&spec, &project, &present);
                if !missing.is_empty() || approval.is_some() {
                    return Ok(Err(OrchestratorError::AdvanceBlocked {
                        phase,
                        missing,
                        approval,
                    }));
                }
                match db.advance_phase(project.id, phase)? {
                    Some(updated) => Ok(Ok(updated)),
                    None => anyhow::bail!("Project {} changed phase during advance", slug),
                }
            })
            .await
            .map_err(OrchestratorError::Storage)?;

        let updated = outcome?;
        tracing::info!(
            project = %updated.slug,
            from = %project.current_phase,
            to = %updated.current_phase,
            "Project advanced"
        );
        Ok(updated)
    }

    pub async fn status(&self, project: &Project) -> Result<StatusReport, OrchestratorError> {
        let project_id = project.id;
        let artifacts = self
            .db
            .call(move |db| db.latest_artifacts(project_id, None))
            .await
            .map_err(OrchestratorError::Storage)?;

        let phases = Phase::ALL
            .iter()
            .map(|&phase| {
                let def = self.spec.definition(phase);
                let state = if project.completed_phases.contains(&phase) {
                    PhaseState::Completed
                } else if phase == project.current_phase {
                    PhaseState::Current
                } else {
                    PhaseState::Pending
                };
                PhaseStatus {
                    phase,
                    state,
                    description: def.description.clone(),
                    executors: def.executors.iter().map(|e| e.to_string()).collect(),
                    artifacts: def
                        .artifacts
                        .iter()
                        .map(|req| {
                            let found = artifacts
                                .iter()
                                .find(|a| a.phase == phase && a.name == req.name);
                            ArtifactStatus {
                                name: req.name.clone(),
                                present: found.is_some(),
                                version: found.map(|a| a.version),
                            }
                        })
                        .collect(),
                    approval: def.approval,
                    approved: def.approval.map(|k| project.is_approved(k)),
                }
            })
            .collect();

        let current = project.current_phase;
        let blockers = if current.is_terminal() {
            vec![format!("{} is the final phase", current)]
        } else {
            let present: Vec<_> = artifacts
                .into_iter()
                .filter(|a| a.phase == current)
                .collect();
            let (missing, approval) = blockers(&self.spec, project, &present);
            missing
                .into_iter()
                .map(|name| format!("missing artifact {}", name))
                .chain(approval.map(|k| format!("{} selection not approved", k)))
                .collect()
        };

        Ok(StatusReport {
            project: project.slug.clone(),
            current_phase: current,
            completed_phases: project.completed_phases.clone(),
            can_advance: blockers.is_empty(),
            blockers,
            running: self.guard.is_running(project.id),
            phases,
        })
    }
}

/// Required artifacts of the current phase that do not exist yet, and the
/// approval it still waits for.
fn blockers(
    spec: &PhaseSpec,
    project: &Project,
    present: &[Artifact],
) -> (Vec<String>, Option<ApprovalKind>) {
    let def = spec.definition(project.current_phase);
    let missing = def
        .artifacts
        .iter()
        .filter(|req| !present.iter().any(|a| a.name == req.name))
        .map(|req| req.name.clone())
        .collect();
    let approval = def.approval.filter(|&k| !project.is_approved(k));
    (missing, approval)
}

/// Invoke the phase's executors in order and validate the combined output.
/// Later executors see earlier executors' documents as prior artifacts.
pub async fn run_executors(
    llm: &dyn LlmClient,
    spec: &PhaseSpec,
    phase: Phase,
    ctx: &ProjectContext,
    prior: &ArtifactSet,
) -> Result<Vec<GeneratedDocument>, OrchestratorError> {
    let mut working = prior.clone();
    let mut produced = ArtifactSet::new();

    for &kind in &spec.definition(phase).executors {
        let params = spec.params_for(kind);
        tracing::debug!(executor = %kind, model = %params.model, "Running executor");
        let docs = kind.execute(llm, &params, ctx, &working).await?;
        working.extend(docs.iter().cloned());
        produced.extend(docs);
    }

    for doc in produced.iter() {
        spec.check_document(phase, &doc.name, &doc.content)
            .map_err(|message| OrchestratorError::InvalidArtifact {
                name: doc.name.clone(),
                message,
            })?;
    }
    Ok(produced.into_documents())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;
    use crate::store::SpecflowDb;
    use crate::test_support::ScriptedLlm;

    struct Fixture {
        orchestrator: Orchestrator,
        db: DbHandle,
        llm: Arc<ScriptedLlm>,
        _dir: tempfile::TempDir,
    }

    fn fixture(responses: Vec<Result<String, LlmError>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(SpecflowDb::new_in_memory().unwrap());
        let llm = Arc::new(ScriptedLlm::new(responses));
        let orchestrator = Orchestrator::new(
            db.clone(),
            ArtifactFiles::new(dir.path()),
            llm.clone(),
            Arc::new(PhaseSpec::builtin().unwrap()),
        );
        Fixture {
            orchestrator,
            db,
            llm,
            _dir: dir,
        }
    }

    async fn create(db: &DbHandle, name: &'static str) -> Project {
        db.call(move |db| db.create_project(name, "An online shop", None))
            .await
            .unwrap()
    }

    async fn artifact_count(db: &DbHandle, project_id: i64) -> usize {
        db.call(move |db| db.latest_artifacts(project_id, None))
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_execute_analysis_persists_artifacts() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        let run = f.orchestrator.execute_phase(&project, "ANALYSIS").await.unwrap();

        let names: Vec<_> = run.artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["project-brief.md", "constitution.md"]);
        assert!(run.artifacts.iter().all(|a| a.version == 1));
        assert_eq!(artifact_count(&f.db, project.id).await, 2);
        assert!(
            f._dir
                .path()
                .join("shop/ANALYSIS/project-brief.md")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_rerun_increments_versions() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        f.orchestrator.execute_phase(&project, "ANALYSIS").await.unwrap();
        let run = f.orchestrator.execute_phase(&project, "ANALYSIS").await.unwrap();
        assert!(run.artifacts.iter().all(|a| a.version == 2));
    }

    #[tokio::test]
    async fn test_unknown_phase_rejected_before_any_llm_call() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        let err = f
            .orchestrator
            .execute_phase(&project, "DEPLOYMENT")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownPhase(ref p) if p == "DEPLOYMENT"));
        assert!(f.llm.calls().is_empty());
        assert_eq!(artifact_count(&f.db, project.id).await, 0);
    }

    #[tokio::test]
    async fn test_only_current_phase_can_execute() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        let err = f.orchestrator.execute_phase(&project, "SPEC").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotCurrentPhase {
                requested: Phase::Spec,
                current: Phase::Analysis
            }
        ));
        assert!(f.llm.calls().is_empty());

        let err = f
            .orchestrator
            .execute_phase(&project, "STACK_SELECTION")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoExecutors(Phase::StackSelection)));
    }

    #[tokio::test]
    async fn test_executor_failure_persists_nothing() {
        let f = fixture(vec![
            Ok("# Brief\n\nA brief long enough to satisfy the validator.".into()),
            Err(LlmError::Timeout { secs: 120 }),
        ]);
        let project = create(&f.db, "Shop").await;
        let err = f
            .orchestrator
            .execute_phase(&project, "ANALYSIS")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Executor(_)));
        assert_eq!(artifact_count(&f.db, project.id).await, 0);
        // The guard is released after a failure.
        assert!(f.orchestrator.execute_phase(&project, "ANALYSIS").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_document_persists_nothing() {
        let f = fixture(vec![Ok("# Too short".into())]);
        let project = create(&f.db, "Shop").await;
        let err = f
            .orchestrator
            .execute_phase(&project, "ANALYSIS")
            .await
            .unwrap_err();
        assert!(
            matches!(err, OrchestratorError::InvalidArtifact { ref name, .. } if name == "project-brief.md")
        );
        assert_eq!(artifact_count(&f.db, project.id).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_execution_is_rejected() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        let _held = f.orchestrator.guard.try_acquire(project.id).unwrap();
        let err = f
            .orchestrator
            .execute_phase(&project, "ANALYSIS")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));
        assert!(f.llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spec_phase_architect_sees_product_manager_output() {
        let f = fixture(vec![
            Ok("# PRD\n\nPRD-MARKER: customers can check out with a saved card.".into()),
            Ok("{\"endpoints\": []}".into()),
        ]);
        let project = create(&f.db, "Shop").await;
        let spec = f.orchestrator.spec();
        let ctx = ProjectContext {
            project_id: project.id,
            slug: project.slug.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            stack: None,
            dependencies: None,
        };
        let docs = run_executors(f.llm.as_ref(), spec, Phase::Spec, &ctx, &ArtifactSet::new())
            .await
            .unwrap();
        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["prd.md", "api-spec.json", "architecture.md"]);

        let calls = f.llm.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].prompt.contains("PRD-MARKER"));
    }

    #[tokio::test]
    async fn test_advance_requires_artifacts_then_approval() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;

        let err = f.orchestrator.advance(&project).await.unwrap_err();
        match err {
            OrchestratorError::AdvanceBlocked { missing, approval, .. } => {
                assert_eq!(missing, vec!["project-brief.md", "constitution.md"]);
                assert!(approval.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }

        f.orchestrator.execute_phase(&project, "ANALYSIS").await.unwrap();
        let project = f.orchestrator.advance(&project).await.unwrap();
        assert_eq!(project.current_phase, Phase::StackSelection);
        assert_eq!(project.completed_phases, vec![Phase::Analysis]);

        let err = f.orchestrator.advance(&project).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AdvanceBlocked {
                approval: Some(ApprovalKind::Stack),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_status_reports_blockers() {
        let f = fixture(vec![]);
        let project = create(&f.db, "Shop").await;
        let report = f.orchestrator.status(&project).await.unwrap();
        assert_eq!(report.current_phase, Phase::Analysis);
        assert!(!report.can_advance);
        assert_eq!(report.phases.len(), 6);
        assert_eq!(report.phases[0].state, PhaseState::Current);
        assert_eq!(report.phases[1].state, PhaseState::Pending);
        assert_eq!(report.phases[1].approved, Some(false));

        f.orchestrator.execute_phase(&project, "ANALYSIS").await.unwrap();
        let report = f.orchestrator.status(&project).await.unwrap();
        assert!(report.can_advance);
        assert!(report.phases[0].artifacts.iter().all(|a| a.present));
    }
}
