//! Stack and dependency approval.
//!
//! An approval resolves the wizard's request into a selection, renders the
//! decision and rationale records, and stores selection, records and the
//! approval flag together. Re-approving appends; nothing is deleted.

pub mod presets;
pub mod records;

use serde::{Deserialize, Serialize};

use crate::errors::ApprovalError;
use crate::phase::{ApprovalKind, Phase};
use crate::store::{ArtifactFiles, ArtifactSummary, DbHandle, NewArtifact, Project, Selection};

pub const MAX_CHOICE_LEN: usize = 100;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_PACKAGES: usize = 200;

/// The stack a project was approved with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSelection {
    pub source: String,
    pub preset_id: Option<String>,
    pub label: String,
    pub frontend: String,
    pub backend: String,
    pub database: String,
    pub deployment: String,
    pub architecture_pattern: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: String,
    pub version: Option<String>,
    pub purpose: Option<String>,
    pub ecosystem: Option<String>,
}

/// The dependency set a project was approved with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySelection {
    pub source: String,
    pub preset_id: Option<String>,
    pub label: String,
    pub packages: Vec<Package>,
    pub notes: Option<String>,
}

// ── Requests ──────────────────────────────────────────────────────────

/// Body of `approve-stack`. `source` defaults to `preset` when a
/// `preset_id` is given and `custom` otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackApprovalRequest {
    pub source: Option<String>,
    pub preset_id: Option<String>,
    pub label: Option<String>,
    pub frontend: Option<String>,
    pub backend: Option<String>,
    pub database: Option<String>,
    pub deployment: Option<String>,
    pub architecture_pattern: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencyApprovalRequest {
    pub source: Option<String>,
    pub preset_id: Option<String>,
    pub label: Option<String>,
    pub packages: Option<Vec<Package>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Preset,
    Custom,
}

fn resolve_source(source: Option<&str>, preset_id: Option<&str>) -> Result<Source, ApprovalError> {
    match source.map(str::trim) {
        Some("preset") => Ok(Source::Preset),
        Some("custom") => Ok(Source::Custom),
        Some(other) => Err(ApprovalError::Invalid(format!(
            "source must be 'preset' or 'custom', got '{}'",
            other
        ))),
        None if preset_id.is_some() => Ok(Source::Preset),
        None => Ok(Source::Custom),
    }
}

/// Trimmed, non-empty, bounded.
fn required(field: &str, value: Option<&str>, max: usize) -> Result<String, ApprovalError> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(ApprovalError::Invalid(format!("{} is required", field)));
    }
    bounded(field, value, max)
}

fn optional(field: &str, value: Option<&str>, max: usize) -> Result<Option<String>, ApprovalError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => bounded(field, v, max).map(Some),
        None => Ok(None),
    }
}

fn bounded(field: &str, value: &str, max: usize) -> Result<String, ApprovalError> {
    if value.chars().count() > max {
        return Err(ApprovalError::Invalid(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

impl StackApprovalRequest {
    pub fn resolve(&self) -> Result<StackSelection, ApprovalError> {
        let notes = optional("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        match resolve_source(self.source.as_deref(), self.preset_id.as_deref())? {
            Source::Preset => {
                let id = required("preset_id", self.preset_id.as_deref(), MAX_CHOICE_LEN)?;
                let preset = presets::stack_preset(&id).ok_or_else(|| {
                    ApprovalError::Invalid(format!("Unknown stack preset '{}'", id))
                })?;
                Ok(StackSelection {
                    source: "preset".into(),
                    preset_id: Some(preset.id.to_string()),
                    label: preset.label.to_string(),
                    frontend: preset.frontend.to_string(),
                    backend: preset.backend.to_string(),
                    database: preset.database.to_string(),
                    deployment: preset.deployment.to_string(),
                    architecture_pattern: Some(preset.architecture_pattern.to_string()),
                    notes,
                })
            }
            Source::Custom => Ok(StackSelection {
                source: "custom".into(),
                preset_id: None,
                label: optional("label", self.label.as_deref(), MAX_CHOICE_LEN)?
                    .unwrap_or_else(|| "Custom stack".to_string()),
                frontend: required("frontend", self.frontend.as_deref(), MAX_CHOICE_LEN)?,
                backend: required("backend", self.backend.as_deref(), MAX_CHOICE_LEN)?,
                database: required("database", self.database.as_deref(), MAX_CHOICE_LEN)?,
                deployment: required("deployment", self.deployment.as_deref(), MAX_CHOICE_LEN)?,
                architecture_pattern: optional(
                    "architecture_pattern",
                    self.architecture_pattern.as_deref(),
                    MAX_CHOICE_LEN,
                )?,
                notes,
            }),
        }
    }
}

impl DependencyApprovalRequest {
    pub fn resolve(&self) -> Result<DependencySelection, ApprovalError> {
        let notes = optional("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        match resolve_source(self.source.as_deref(), self.preset_id.as_deref())? {
            Source::Preset => {
                let id = required("preset_id", self.preset_id.as_deref(), MAX_CHOICE_LEN)?;
                let preset = presets::dependency_preset(&id).ok_or_else(|| {
                    ApprovalError::Invalid(format!("Unknown dependency preset '{}'", id))
                })?;
                Ok(DependencySelection {
                    source: "preset".into(),
                    preset_id: Some(preset.id.to_string()),
                    label: preset.label.to_string(),
                    packages: preset
                        .packages
                        .iter()
                        .map(|p| Package {
                            name: p.name.to_string(),
                            version: Some(p.version.to_string()),
                            purpose: Some(p.purpose.to_string()),
                            ecosystem: Some(p.ecosystem.to_string()),
                        })
                        .collect(),
                    notes,
                })
            }
            Source::Custom => {
                let input = self.packages.as_deref().unwrap_or_default();
                if input.is_empty() {
                    return Err(ApprovalError::Invalid(
                        "packages must contain at least one package".into(),
                    ));
                }
                if input.len() > MAX_PACKAGES {
                    return Err(ApprovalError::Invalid(format!(
                        "at most {} packages may be approved",
                        MAX_PACKAGES
                    )));
                }
                let packages = input
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        Ok(Package {
                            name: required(
                                &format!("packages[{}].name", i),
                                Some(p.name.as_str()),
                                MAX_CHOICE_LEN,
                            )?,
                            version: optional("version", p.version.as_deref(), MAX_CHOICE_LEN)?,
                            purpose: optional("purpose", p.purpose.as_deref(), MAX_PURPOSE_LEN)?,
                            ecosystem: optional(
                                "ecosystem",
                                p.ecosystem.as_deref(),
                                MAX_CHOICE_LEN,
                            )?,
                        })
                    })
                    .collect::<Result<Vec<_>, ApprovalError>>()?;
                Ok(DependencySelection {
                    source: "custom".into(),
                    preset_id: None,
                    label: optional("label", self.label.as_deref(), MAX_CHOICE_LEN)?
                        .unwrap_or_else(|| "Custom dependencies".to_string()),
                    packages,
                    notes,
                })
            }
        }
    }
}

// ── Approval ──────────────────────────────────────────────────────────

/// What an approval wrote.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub project: Project,
    pub selection: Selection,
    pub artifacts: Vec<ArtifactSummary>,
}

pub async fn approve_stack(
    db: &DbHandle,
    files: &ArtifactFiles,
    project: &Project,
    request: &StackApprovalRequest,
) -> Result<ApprovalOutcome, ApprovalError> {
    ensure_reached(project, ApprovalKind::Stack)?;
    let stack = request.resolve()?;
    let docs = vec![
        NewArtifact {
            phase: Phase::StackSelection,
            name: records::STACK_DECISION.to_string(),
            content: records::stack_decision(&project.name, &stack),
        },
        NewArtifact {
            phase: Phase::StackSelection,
            name: records::STACK_RATIONALE.to_string(),
            content: records::stack_rationale(&project.name, &stack),
        },
    ];
    let payload = serde_json::to_value(&stack)
        .map_err(|e| ApprovalError::Storage(anyhow::anyhow!(e)))?;
    record(db, files, project, ApprovalKind::Stack, payload, docs).await
}

pub async fn approve_dependencies(
    db: &DbHandle,
    files: &ArtifactFiles,
    project: &Project,
    request: &DependencyApprovalRequest,
) -> Result<ApprovalOutcome, ApprovalError> {
    ensure_reached(project, ApprovalKind::Dependencies)?;
    let deps = request.resolve()?;
    let docs = vec![
        NewArtifact {
            phase: Phase::Dependencies,
            name: records::DEPENDENCIES_MANIFEST.to_string(),
            content: records::dependencies_manifest(&deps),
        },
        NewArtifact {
            phase: Phase::Dependencies,
            name: records::DEPENDENCY_RATIONALE.to_string(),
            content: records::dependency_rationale(&project.name, &deps),
        },
    ];
    let payload = serde_json::to_value(&deps)
        .map_err(|e| ApprovalError::Storage(anyhow::anyhow!(e)))?;
    record(db, files, project, ApprovalKind::Dependencies, payload, docs).await
}

fn ensure_reached(project: &Project, kind: ApprovalKind) -> Result<(), ApprovalError> {
    let required = kind.phase();
    if !project.has_reached(required) {
        return Err(ApprovalError::PhaseNotReached {
            required,
            current: project.current_phase,
        });
    }
    Ok(())
}

async fn record(
    db: &DbHandle,
    files: &ArtifactFiles,
    project: &Project,
    kind: ApprovalKind,
    payload: serde_json::Value,
    docs: Vec<NewArtifact>,
) -> Result<ApprovalOutcome, ApprovalError> {
    let project_id = project.id;
    let (selection, artifacts, updated) = db
        .call(move |db| db.record_approval(project_id, kind, &payload, &docs))
        .await
        .map_err(ApprovalError::Storage)?;

    files
        .write_artifacts(&updated.slug, &artifacts)
        .await
        .map_err(ApprovalError::Storage)?;

    tracing::info!(
        project = %updated.slug,
        kind = %kind,
        selection_id = selection.id,
        "Selection approved"
    );

    Ok(ApprovalOutcome {
        project: updated,
        selection,
        artifacts: artifacts.iter().map(|a| a.summary()).collect(),
    })
}

/// Parse the stored payload of the latest selection of each kind.
pub fn decode_stack(selection: &Selection) -> Result<StackSelection, serde_json::Error> {
    serde_json::from_value(selection.payload.clone())
}

pub fn decode_dependencies(selection: &Selection) -> Result<DependencySelection, serde_json::Error> {
    serde_json::from_value(selection.payload.clone())
}
