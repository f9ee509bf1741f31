use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::phase::{ApprovalKind, Phase};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub current_phase: Phase,
    pub completed_phases: Vec<Phase>,
    pub stack_approved: bool,
    pub dependencies_approved: bool,
    pub owner_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    pub fn is_approved(&self, kind: ApprovalKind) -> bool {
        match kind {
            ApprovalKind::Stack => self.stack_approved,
            ApprovalKind::Dependencies => self.dependencies_approved,
        }
    }

    /// True once the project's current phase is `phase` or later.
    pub fn has_reached(&self, phase: Phase) -> bool {
        self.current_phase >= phase
    }
}

/// A stored artifact version including its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: i64,
    pub project_id: i64,
    pub phase: Phase,
    pub name: String,
    pub version: i64,
    pub content: String,
    pub created_at: String,
}

impl Artifact {
    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            phase: self.phase,
            name: self.name.clone(),
            version: self.version,
            size: self.content.len(),
            created_at: self.created_at.clone(),
        }
    }
}

/// Listing view of an artifact version, without the content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSummary {
    pub phase: Phase,
    pub name: String,
    pub version: i64,
    pub size: usize,
    pub created_at: String,
}

/// Content to be written as the next version of `(phase, name)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub phase: Phase,
    pub name: String,
    pub content: String,
}

/// One approval action. Later rows supersede earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub id: i64,
    pub project_id: i64,
    pub kind: ApprovalKind,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}
