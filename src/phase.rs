//! Phase enum and the declarative phase specification.
//!
//! This module provides:
//! - `Phase`, the six fixed stages a project moves through
//! - `PhaseSpec`, loaded from TOML, naming each phase's executors, required
//!   artifacts with their validators, approval gate and LLM parameters
//!
//! The built-in specification lives in `phases.toml` next to this file and
//! can be replaced wholesale with `PHASE_SPEC_PATH`. It is read once at
//! start-up and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::agents::ExecutorKind;

const BUILTIN_SPEC: &str = include_str!("phases.toml");

/// A project phase. Declaration order is the only legal progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Analysis,
    StackSelection,
    Spec,
    Dependencies,
    Solutioning,
    Done,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Analysis,
        Phase::StackSelection,
        Phase::Spec,
        Phase::Dependencies,
        Phase::Solutioning,
        Phase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "ANALYSIS",
            Self::StackSelection => "STACK_SELECTION",
            Self::Spec => "SPEC",
            Self::Dependencies => "DEPENDENCIES",
            Self::Solutioning => "SOLUTIONING",
            Self::Done => "DONE",
        }
    }

    /// Position in the fixed ordering, starting at 0.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// The single legal successor, or `None` for `DONE`.
    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.get(self.ordinal() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// Phases strictly before this one, in order.
    pub fn predecessors(&self) -> Vec<Phase> {
        Phase::ALL[..self.ordinal()].to_vec()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANALYSIS" => Ok(Self::Analysis),
            "STACK_SELECTION" => Ok(Self::StackSelection),
            "SPEC" => Ok(Self::Spec),
            "DEPENDENCIES" => Ok(Self::Dependencies),
            "SOLUTIONING" => Ok(Self::Solutioning),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("Unknown phase '{}'", s)),
        }
    }
}

/// Which user approval gates a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Stack,
    Dependencies,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stack => "stack",
            Self::Dependencies => "dependencies",
        }
    }

    /// The phase whose artifacts this approval produces.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Stack => Phase::StackSelection,
            Self::Dependencies => Phase::Dependencies,
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stack" => Ok(Self::Stack),
            "dependencies" => Ok(Self::Dependencies),
            _ => Err(format!("Invalid approval kind: {}", s)),
        }
    }
}

/// How a generated artifact is checked before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validator {
    /// Non-empty and contains at least one `#` heading.
    Markdown,
    /// Parses as JSON.
    Json,
}

impl Validator {
    pub fn check(&self, content: &str) -> Result<(), String> {
        if content.trim().is_empty() {
            return Err("content is empty".to_string());
        }
        match self {
            Validator::Markdown => {
                if content.lines().any(|l| l.trim_start().starts_with('#')) {
                    Ok(())
                } else {
                    Err("markdown document has no heading".to_string())
                }
            }
            Validator::Json => serde_json::from_str::<serde_json::Value>(content)
                .map(|_| ())
                .map_err(|e| format!("invalid JSON: {}", e)),
        }
    }
}

/// One artifact a phase must produce before it can be left.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRequirement {
    pub name: String,
    pub validator: Validator,
    #[serde(default)]
    pub min_length: usize,
}

impl ArtifactRequirement {
    pub fn check(&self, content: &str) -> Result<(), String> {
        self.validator.check(content)?;
        let len = content.trim().chars().count();
        if len < self.min_length {
            return Err(format!(
                "content is {} characters, minimum is {}",
                len, self.min_length
            ));
        }
        Ok(())
    }
}

/// Generation parameters passed to the LLM client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Per-executor overrides on top of the global `[llm]` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmParamsOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    pub phase: Phase,
    #[serde(default)]
    pub description: String,
    /// Executors run in this order; later ones see earlier outputs.
    #[serde(default)]
    pub executors: Vec<ExecutorKind>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRequirement>,
    #[serde(default)]
    pub approval: Option<ApprovalKind>,
}

impl PhaseDefinition {
    pub fn requirement(&self, name: &str) -> Option<&ArtifactRequirement> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

/// The full phase specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    pub llm: LlmParams,
    #[serde(default)]
    pub executors: BTreeMap<String, LlmParamsOverride>,
    pub phases: Vec<PhaseDefinition>,
}

impl PhaseSpec {
    /// The specification compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_SPEC).context("Built-in phase spec is invalid")
    }

    /// Load a specification from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase spec: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid phase spec: {}", path.display()))
    }

    /// Load from `path` when given, otherwise use the built-in spec.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let spec: PhaseSpec = toml::from_str(content).context("Failed to parse phase spec TOML")?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.phases.len() != Phase::ALL.len() {
            bail!(
                "expected {} phases, found {}",
                Phase::ALL.len(),
                self.phases.len()
            );
        }
        for (def, expected) in self.phases.iter().zip(Phase::ALL) {
            if def.phase != expected {
                bail!(
                    "phase {} is out of order (expected {} at position {})",
                    def.phase,
                    expected,
                    expected.ordinal() + 1
                );
            }
            if let Some(kind) = def.approval
                && kind.phase() != def.phase
            {
                bail!("phase {} cannot be gated by the {} approval", def.phase, kind);
            }
            for executor in &def.executors {
                for document in executor.documents() {
                    if def.requirement(document).is_none() {
                        bail!(
                            "phase {} runs {} but does not declare its artifact {}",
                            def.phase,
                            executor,
                            document
                        );
                    }
                }
            }
        }
        let done = &self.phases[Phase::Done.ordinal()];
        if !done.executors.is_empty() || !done.artifacts.is_empty() || done.approval.is_some() {
            bail!("phase DONE must not declare executors, artifacts or approvals");
        }

        check_params("[llm]", &self.llm.model, self.llm.temperature, self.llm.max_tokens)?;
        for (name, params) in &self.executors {
            let kind = ExecutorKind::from_str(name).map_err(|e| anyhow::anyhow!(e))?;
            let resolved = self.params_for(kind);
            check_params(
                &format!("[executors.{}]", name),
                &resolved.model,
                resolved.temperature,
                resolved.max_tokens,
            )?;
            if params.model.as_deref() == Some("") {
                bail!("[executors.{}] model must not be empty", name);
            }
        }
        Ok(())
    }

    pub fn definition(&self, phase: Phase) -> &PhaseDefinition {
        // `validate` guarantees one definition per phase, in order.
        &self.phases[phase.ordinal()]
    }

    /// Resolve the LLM parameters for one executor.
    pub fn params_for(&self, kind: ExecutorKind) -> LlmParams {
        let mut params = self.llm.clone();
        if let Some(o) = self.executors.get(kind.as_str()) {
            if let Some(model) = &o.model {
                params.model = model.clone();
            }
            if let Some(temperature) = o.temperature {
                params.temperature = temperature;
            }
            if let Some(max_tokens) = o.max_tokens {
                params.max_tokens = max_tokens;
            }
        }
        params
    }

    /// Validate a generated document against its phase requirement.
    pub fn check_document(&self, phase: Phase, name: &str, content: &str) -> Result<(), String> {
        match self.definition(phase).requirement(name) {
            Some(req) => req.check(content),
            None => Err(format!("{} is not an artifact of phase {}", name, phase)),
        }
    }
}

fn check_params(section: &str, model: &str, temperature: f32, max_tokens: u32) -> Result<()> {
    if model.trim().is_empty() {
        bail!("{} model must not be empty", section);
    }
    if !(0.0..=1.0).contains(&temperature) {
        bail!("{} temperature {} is outside [0, 1]", section, temperature);
    }
    if max_tokens == 0 {
        bail!("{} max_tokens must be positive", section);
    }
    Ok(())
}
