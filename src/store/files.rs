use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::models::Artifact;
use crate::phase::Phase;

const MAX_NAME_LEN: usize = 100;

/// Check that an artifact or slug segment is a single safe path component.
pub fn validate_segment(segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err("name is required".to_string());
    }
    if segment.len() > MAX_NAME_LEN {
        return Err(format!("name exceeds {} characters", MAX_NAME_LEN));
    }
    if segment.starts_with('.') {
        return Err(format!("name '{}' must not start with '.'", segment));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!(
            "name '{}' may only contain letters, digits, '.', '-' and '_'",
            segment
        ));
    }
    Ok(())
}

/// Filesystem mirror of the latest artifact versions, laid out as
/// `<root>/<slug>/<PHASE>/<name>`. The database stays authoritative; the
/// mirror is rewritten after each successful commit.
#[derive(Debug, Clone)]
pub struct ArtifactFiles {
    root: PathBuf,
}

impl ArtifactFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, slug: &str, phase: Phase, name: &str) -> Result<PathBuf> {
        validate_segment(slug).map_err(|e| anyhow::anyhow!("invalid slug: {}", e))?;
        validate_segment(name).map_err(|e| anyhow::anyhow!("invalid artifact name: {}", e))?;
        Ok(self.root.join(slug).join(phase.as_str()).join(name))
    }

    /// Write one document, replacing any previous copy atomically.
    pub async fn write(&self, slug: &str, phase: Phase, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.path_for(slug, phase, name)?;
        let dir = path
            .parent()
            .context("artifact path has no parent directory")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = tmp_path(&path, name);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(path)
    }

    /// Mirror a batch of freshly committed artifacts.
    pub async fn write_artifacts(&self, slug: &str, artifacts: &[Artifact]) -> Result<()> {
        for artifact in artifacts {
            self.write(slug, artifact.phase, &artifact.name, &artifact.content)
                .await?;
        }
        Ok(())
    }

    /// Remove a project's directory. Missing directories are not an error.
    pub async fn remove_project(&self, slug: &str) -> Result<()> {
        validate_segment(slug).map_err(|e| anyhow::anyhow!("invalid slug: {}", e))?;
        let dir = self.root.join(slug);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}

/// Sibling temp file unique to `name`, so artifacts sharing a stem never
/// share a temp file.
fn tmp_path(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(format!("{}.tmp", name))
}
