use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::phase::{ApprovalKind, Phase};

/// Async-safe handle to the database.
///
/// Wraps `SpecflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SpecflowDb>>,
}

impl DbHandle {
    pub fn new(db: SpecflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SpecflowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Convert a project name to a URL-safe slug of at most `max_len` characters.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

const SLUG_MAX_LEN: usize = 60;

const PROJECT_COLUMNS: &str = "id, slug, name, description, current_phase, completed_phases, \
     stack_approved, dependencies_approved, owner_id, created_at, updated_at";

const ARTIFACT_COLUMNS: &str = "id, project_id, phase, name, version, content, created_at";

const USER_COLUMNS: &str = "id, email, name, role, created_at";

pub struct SpecflowDb {
    conn: Connection,
}

impl SpecflowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL DEFAULT '',
                    role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
                    api_key_hash TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slug TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    current_phase TEXT NOT NULL DEFAULT 'ANALYSIS',
                    completed_phases TEXT NOT NULL DEFAULT '[]',
                    stack_approved INTEGER NOT NULL DEFAULT 0,
                    dependencies_approved INTEGER NOT NULL DEFAULT 0,
                    owner_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(project_id, phase, name, version)
                );

                CREATE TABLE IF NOT EXISTS selections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL CHECK (kind IN ('stack', 'dependencies')),
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_lookup ON artifacts(project_id, phase, name);
                CREATE INDEX IF NOT EXISTS idx_selections_project ON selections(project_id, kind);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Insert a user. Returns `None` when the email is already registered.
    pub fn create_user(
        &self,
        email: &str,
        name: &str,
        role: Role,
        api_key_hash: &str,
    ) -> Result<Option<User>> {
        if self.get_user_by_email(email)?.is_some() {
            return Ok(None);
        }
        self.conn
            .execute(
                "INSERT INTO users (email, name, role, api_key_hash) VALUES (?1, ?2, ?3, ?4)",
                params![email, name, role.as_str(), api_key_hash],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.query_user(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
        )
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.query_user(
            &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
            params![email],
        )
    }

    pub fn get_user_by_key_hash(&self, api_key_hash: &str) -> Result<Option<User>> {
        self.query_user(
            &format!("SELECT {} FROM users WHERE api_key_hash = ?1", USER_COLUMNS),
            params![api_key_hash],
        )
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map([], UserRow::from_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    pub fn update_user_role(&self, id: i64, role: Role) -> Result<Option<User>> {
        let changed = self
            .conn
            .execute(
                "UPDATE users SET role = ?1 WHERE id = ?2",
                params![role.as_str(), id],
            )
            .context("Failed to update user role")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_user(id)
    }

    pub fn count_admins(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users WHERE role = 'admin'", [], |row| {
                row.get(0)
            })
            .context("Failed to count admins")
    }

    fn query_user<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(sql, params, UserRow::from_row)
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Insert a project in ANALYSIS. The slug is derived from the name and
    /// suffixed with `-2`, `-3`, ... on collision.
    pub fn create_project(
        &self,
        name: &str,
        description: &str,
        owner_id: Option<i64>,
    ) -> Result<Project> {
        let base = match slugify(name, SLUG_MAX_LEN) {
            s if s.is_empty() => "project".to_string(),
            s => s,
        };
        let slug = self.unique_slug(&base)?;
        self.conn
            .execute(
                "INSERT INTO projects (slug, name, description, owner_id) VALUES (?1, ?2, ?3, ?4)",
                params![slug, name, description, owner_id],
            )
            .context("Failed to insert project")?;
        self.get_project(&slug)?
            .context("Project not found after insert")
    }

    fn unique_slug(&self, base: &str) -> Result<String> {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.slug_exists(&candidate)? {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        Ok(candidate)
    }

    fn slug_exists(&self, slug: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .context("Failed to check slug")?;
        Ok(count > 0)
    }

    /// All projects, or only those owned by `owner_id`.
    pub fn list_projects(&self, owner_id: Option<i64>) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY id",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![owner_id], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, slug: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE slug = ?1", PROJECT_COLUMNS),
                params![slug],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    fn get_project_by_id(&self, id: i64) -> Result<Project> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                ProjectRow::from_row,
            )
            .with_context(|| format!("Project {} not found", id))?;
        row.into_project()
    }

    /// Update name and/or description. The slug never changes.
    pub fn update_project(
        &self,
        slug: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Project>> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects
                 SET name = COALESCE(?1, name),
                     description = COALESCE(?2, description),
                     updated_at = datetime('now')
                 WHERE slug = ?3",
                params![name, description, slug],
            )
            .context("Failed to update project")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_project(slug)
    }

    /// Delete a project; artifacts and selections cascade.
    pub fn delete_project(&self, slug: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE slug = ?1", params![slug])
            .context("Failed to delete project")?;
        Ok(changed > 0)
    }

    /// Move a project from `from` to its successor. The update only applies
    /// while the stored phase still equals `from`, so a phase can never be
    /// skipped or regress. Returns `None` when the project moved meanwhile.
    pub fn advance_phase(&self, project_id: i64, from: Phase) -> Result<Option<Project>> {
        let next = from
            .next()
            .with_context(|| format!("Phase {} has no successor", from))?;
        let mut completed = from.predecessors();
        completed.push(from);
        let completed_json =
            serde_json::to_string(&completed).context("Failed to encode completed phases")?;

        let changed = self
            .conn
            .execute(
                "UPDATE projects
                 SET current_phase = ?1, completed_phases = ?2, updated_at = datetime('now')
                 WHERE id = ?3 AND current_phase = ?4",
                params![next.as_str(), completed_json, project_id, from.as_str()],
            )
            .context("Failed to advance project phase")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_project_by_id(project_id).map(Some)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Write every document as the next version of its `(phase, name)` in a
    /// single transaction. Either all versions land or none do.
    pub fn insert_artifacts(&self, project_id: i64, docs: &[NewArtifact]) -> Result<Vec<Artifact>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin artifact transaction")?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(insert_artifact_row(&tx, project_id, doc)?);
        }
        tx.execute(
            "UPDATE projects SET updated_at = datetime('now') WHERE id = ?1",
            params![project_id],
        )
        .context("Failed to touch project")?;
        tx.commit().context("Failed to commit artifacts")?;

        ids.into_iter().map(|id| self.get_artifact_by_id(id)).collect()
    }

    fn get_artifact_by_id(&self, id: i64) -> Result<Artifact> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS),
                params![id],
                ArtifactRow::from_row,
            )
            .context("Artifact not found after insert")?;
        row.into_artifact()
    }

    /// Latest version of every artifact, optionally restricted to one phase,
    /// ordered by phase then creation.
    pub fn latest_artifacts(&self, project_id: i64, phase: Option<Phase>) -> Result<Vec<Artifact>> {
        let sql = format!(
            "SELECT {} FROM artifacts a
             WHERE a.project_id = ?1
               AND (?2 IS NULL OR a.phase = ?2)
               AND a.version = (
                   SELECT MAX(b.version) FROM artifacts b
                   WHERE b.project_id = a.project_id AND b.phase = a.phase AND b.name = a.name
               )
             ORDER BY a.id",
            ARTIFACT_COLUMNS
        );
        let mut artifacts = self.query_artifacts(&sql, params![project_id, phase.map(|p| p.as_str())])?;
        artifacts.sort_by_key(|a| a.phase);
        Ok(artifacts)
    }

    /// A specific version, or the latest when `version` is `None`.
    pub fn get_artifact(
        &self,
        project_id: i64,
        phase: Phase,
        name: &str,
        version: Option<i64>,
    ) -> Result<Option<Artifact>> {
        let sql = format!(
            "SELECT {} FROM artifacts
             WHERE project_id = ?1 AND phase = ?2 AND name = ?3 AND (?4 IS NULL OR version = ?4)
             ORDER BY version DESC LIMIT 1",
            ARTIFACT_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![project_id, phase.as_str(), name, version],
                ArtifactRow::from_row,
            )
            .optional()
            .context("Failed to query artifact")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    /// Every version of one artifact, oldest first.
    pub fn artifact_versions(
        &self,
        project_id: i64,
        phase: Phase,
        name: &str,
    ) -> Result<Vec<ArtifactSummary>> {
        let sql = format!(
            "SELECT {} FROM artifacts
             WHERE project_id = ?1 AND phase = ?2 AND name = ?3
             ORDER BY version",
            ARTIFACT_COLUMNS
        );
        let artifacts = self.query_artifacts(&sql, params![project_id, phase.as_str(), name])?;
        Ok(artifacts.iter().map(Artifact::summary).collect())
    }

    fn query_artifacts<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare artifact query")?;
        let rows = stmt
            .query_map(params, ArtifactRow::from_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?.into_artifact()?);
        }
        Ok(artifacts)
    }

    // ── Selections / approvals ────────────────────────────────────────

    /// Record an approval: the selection row, its documents and the
    /// approval flag are written in one transaction. Earlier selections and
    /// document versions are kept.
    pub fn record_approval(
        &self,
        project_id: i64,
        kind: ApprovalKind,
        payload: &serde_json::Value,
        docs: &[NewArtifact],
    ) -> Result<(Selection, Vec<Artifact>, Project)> {
        let payload_json = serde_json::to_string(payload).context("Failed to encode selection")?;
        let flag_sql = match kind {
            ApprovalKind::Stack => {
                "UPDATE projects SET stack_approved = 1, updated_at = datetime('now') WHERE id = ?1"
            }
            ApprovalKind::Dependencies => {
                "UPDATE projects SET dependencies_approved = 1, updated_at = datetime('now') WHERE id = ?1"
            }
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin approval transaction")?;
        tx.execute(
            "INSERT INTO selections (project_id, kind, payload) VALUES (?1, ?2, ?3)",
            params![project_id, kind.as_str(), payload_json],
        )
        .context("Failed to insert selection")?;
        let selection_id = tx.last_insert_rowid();
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(insert_artifact_row(&tx, project_id, doc)?);
        }
        let changed = tx
            .execute(flag_sql, params![project_id])
            .context("Failed to set approval flag")?;
        if changed == 0 {
            anyhow::bail!("Project {} not found", project_id);
        }
        tx.commit().context("Failed to commit approval")?;

        let selection = self.get_selection_by_id(selection_id)?;
        let artifacts = ids
            .into_iter()
            .map(|id| self.get_artifact_by_id(id))
            .collect::<Result<Vec<_>>>()?;
        let project = self.get_project_by_id(project_id)?;
        Ok((selection, artifacts, project))
    }

    fn get_selection_by_id(&self, id: i64) -> Result<Selection> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, kind, payload, created_at FROM selections WHERE id = ?1",
                params![id],
                SelectionRow::from_row,
            )
            .context("Selection not found after insert")?;
        row.into_selection()
    }

    /// The current (most recent) selection of a kind.
    pub fn latest_selection(&self, project_id: i64, kind: ApprovalKind) -> Result<Option<Selection>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, kind, payload, created_at FROM selections
                 WHERE project_id = ?1 AND kind = ?2
                 ORDER BY id DESC LIMIT 1",
                params![project_id, kind.as_str()],
                SelectionRow::from_row,
            )
            .optional()
            .context("Failed to query selection")?;
        row.map(SelectionRow::into_selection).transpose()
    }

    pub fn count_selections(&self, project_id: i64, kind: ApprovalKind) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM selections WHERE project_id = ?1 AND kind = ?2",
                params![project_id, kind.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count selections")
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn list_settings(&self) -> Result<Vec<Setting>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM settings ORDER BY key")
            .context("Failed to prepare list_settings")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Setting {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .context("Failed to query settings")?;
        let mut settings = Vec::new();
        for row in rows {
            settings.push(row.context("Failed to read setting row")?);
        }
        Ok(settings)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        self.conn
            .query_row(
                "SELECT key, value, updated_at FROM settings WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Setting {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<Setting> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        self.get_setting(key)?
            .context("Setting not found after upsert")
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(changed > 0)
    }
}

/// Insert the next version of one artifact on `conn` (usually a transaction).
fn insert_artifact_row(conn: &Connection, project_id: i64, doc: &NewArtifact) -> Result<i64> {
    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM artifacts
             WHERE project_id = ?1 AND phase = ?2 AND name = ?3",
            params![project_id, doc.phase.as_str(), doc.name],
            |row| row.get(0),
        )
        .context("Failed to allocate artifact version")?;
    conn.execute(
        "INSERT INTO artifacts (project_id, phase, name, version, content) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![project_id, doc.phase.as_str(), doc.name, version, doc.content],
    )
    .with_context(|| format!("Failed to insert artifact {}/{}", doc.phase, doc.name))?;
    Ok(conn.last_insert_rowid())
}

// ── Row types ─────────────────────────────────────────────────────────
//
// Columns are read as raw strings first and parsed afterwards so enum
// parse failures surface as `anyhow` errors with context.

struct UserRow {
    id: i64,
    email: String,
    name: String,
    role: String,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            role: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            email: self.email,
            name: self.name,
            role: Role::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
        })
    }
}

struct ProjectRow {
    id: i64,
    slug: String,
    name: String,
    description: String,
    current_phase: String,
    completed_phases: String,
    stack_approved: bool,
    dependencies_approved: bool,
    owner_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            current_phase: row.get(4)?,
            completed_phases: row.get(5)?,
            stack_approved: row.get(6)?,
            dependencies_approved: row.get(7)?,
            owner_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let current_phase =
            Phase::from_str(&self.current_phase).map_err(|e| anyhow::anyhow!(e))?;
        let completed_phases: Vec<Phase> = serde_json::from_str(&self.completed_phases)
            .with_context(|| format!("Invalid completed_phases for project {}", self.slug))?;
        Ok(Project {
            id: self.id,
            slug: self.slug,
            name: self.name,
            description: self.description,
            current_phase,
            completed_phases,
            stack_approved: self.stack_approved,
            dependencies_approved: self.dependencies_approved,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ArtifactRow {
    id: i64,
    project_id: i64,
    phase: String,
    name: String,
    version: i64,
    content: String,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            phase: row.get(2)?,
            name: row.get(3)?,
            version: row.get(4)?,
            content: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_artifact(self) -> Result<Artifact> {
        Ok(Artifact {
            id: self.id,
            project_id: self.project_id,
            phase: Phase::from_str(&self.phase).map_err(|e| anyhow::anyhow!(e))?,
            name: self.name,
            version: self.version,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

struct SelectionRow {
    id: i64,
    project_id: i64,
    kind: String,
    payload: String,
    created_at: String,
}

impl SelectionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            kind: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_selection(self) -> Result<Selection> {
        Ok(Selection {
            id: self.id,
            project_id: self.project_id,
            kind: ApprovalKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("Invalid payload for selection {}", self.id))?,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(phase: Phase, name: &str, content: &str) -> NewArtifact {
        NewArtifact {
            phase,
            name: name.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('users', 'projects', 'artifacts', 'selections', 'settings')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("specflow.db");
        {
            let db = SpecflowDb::new(&path)?;
            db.create_project("Persisted", "", None)?;
        }
        let db = SpecflowDb::new(&path)?;
        assert_eq!(db.list_projects(None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Test Project", 60), "test-project");
        assert_eq!(slugify("  Hello, World!!  ", 60), "hello-world");
        assert_eq!(slugify("Café Menu", 60), "caf-menu");
        assert_eq!(slugify("!!!", 60), "");
        assert_eq!(slugify("a very long name indeed", 7), "a-very");
    }

    #[test]
    fn test_create_project_defaults() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Test Project", "desc", None)?;
        assert_eq!(project.slug, "test-project");
        assert_eq!(project.name, "Test Project");
        assert_eq!(project.current_phase, Phase::Analysis);
        assert!(project.completed_phases.is_empty());
        assert!(!project.stack_approved);
        assert!(!project.dependencies_approved);
        assert!(!project.created_at.is_empty());
        Ok(())
    }

    #[test]
    fn test_slug_collisions_get_suffixes() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        assert_eq!(db.create_project("Shop", "", None)?.slug, "shop");
        assert_eq!(db.create_project("shop!", "", None)?.slug, "shop-2");
        assert_eq!(db.create_project("SHOP", "", None)?.slug, "shop-3");
        assert_eq!(db.create_project("???", "", None)?.slug, "project");
        Ok(())
    }

    #[test]
    fn test_list_projects_filters_by_owner() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let alice = db.create_user("a@example.com", "A", Role::User, "ha")?.unwrap();
        let bob = db.create_user("b@example.com", "B", Role::User, "hb")?.unwrap();
        db.create_project("Alpha", "", Some(alice.id))?;
        db.create_project("Beta", "", Some(bob.id))?;
        db.create_project("Gamma", "", Some(alice.id))?;

        assert_eq!(db.list_projects(None)?.len(), 3);
        let mine = db.list_projects(Some(alice.id))?;
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].name, "Alpha");
        assert_eq!(mine[1].name, "Gamma");
        Ok(())
    }

    #[test]
    fn test_update_project_keeps_slug() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        db.create_project("Old Name", "old", None)?;
        let updated = db
            .update_project("old-name", Some("New Name"), None)?
            .expect("project exists");
        assert_eq!(updated.slug, "old-name");
        assert_eq!(updated.name, "New Name");
        assert_eq!(updated.description, "old");
        assert!(db.update_project("missing", Some("x"), None)?.is_none());
        Ok(())
    }

    #[test]
    fn test_delete_project_cascades() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Doomed", "", None)?;
        db.insert_artifacts(project.id, &[doc(Phase::Analysis, "project-brief.md", "# B")])?;
        db.record_approval(
            project.id,
            ApprovalKind::Stack,
            &serde_json::json!({"a": 1}),
            &[],
        )?;

        assert!(db.delete_project("doomed")?);
        assert!(!db.delete_project("doomed")?);
        let artifacts: i64 =
            db.conn
                .query_row("SELECT COUNT(*) FROM artifacts", [], |r| r.get(0))?;
        let selections: i64 =
            db.conn
                .query_row("SELECT COUNT(*) FROM selections", [], |r| r.get(0))?;
        assert_eq!(artifacts, 0);
        assert_eq!(selections, 0);
        Ok(())
    }

    #[test]
    fn test_advance_phase_is_forward_only() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Walk", "", None)?;

        let moved = db.advance_phase(project.id, Phase::Analysis)?.unwrap();
        assert_eq!(moved.current_phase, Phase::StackSelection);
        assert_eq!(moved.completed_phases, vec![Phase::Analysis]);

        // Stale `from` is refused.
        assert!(db.advance_phase(project.id, Phase::Analysis)?.is_none());

        let mut current = moved;
        while current.current_phase.next().is_some() {
            current = db
                .advance_phase(project.id, current.current_phase)?
                .unwrap();
        }
        assert_eq!(current.current_phase, Phase::Done);
        assert_eq!(current.completed_phases.len(), 5);
        assert!(db.advance_phase(project.id, Phase::Done).is_err());
        Ok(())
    }

    #[test]
    fn test_artifact_versions_increment_per_triple() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Versions", "", None)?;

        let first = db.insert_artifacts(
            project.id,
            &[
                doc(Phase::Analysis, "project-brief.md", "# v1"),
                doc(Phase::Analysis, "constitution.md", "# c1"),
            ],
        )?;
        assert_eq!(first[0].version, 1);
        assert_eq!(first[1].version, 1);

        let second =
            db.insert_artifacts(project.id, &[doc(Phase::Analysis, "project-brief.md", "# v2")])?;
        assert_eq!(second[0].version, 2);

        let latest = db.get_artifact(project.id, Phase::Analysis, "project-brief.md", None)?;
        assert_eq!(latest.unwrap().content, "# v2");
        let old = db.get_artifact(project.id, Phase::Analysis, "project-brief.md", Some(1))?;
        assert_eq!(old.unwrap().content, "# v1");
        assert!(
            db.get_artifact(project.id, Phase::Analysis, "project-brief.md", Some(9))?
                .is_none()
        );

        let versions = db.artifact_versions(project.id, Phase::Analysis, "project-brief.md")?;
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2]);

        let latest_all = db.latest_artifacts(project.id, None)?;
        assert_eq!(latest_all.len(), 2);
        assert!(latest_all.iter().all(|a| a.phase == Phase::Analysis));
        Ok(())
    }

    #[test]
    fn test_latest_artifacts_filters_by_phase() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Phases", "", None)?;
        db.insert_artifacts(
            project.id,
            &[
                doc(Phase::Spec, "prd.md", "# PRD"),
                doc(Phase::Analysis, "project-brief.md", "# Brief"),
            ],
        )?;
        let all = db.latest_artifacts(project.id, None)?;
        assert_eq!(all[0].phase, Phase::Analysis, "sorted by phase");
        let spec = db.latest_artifacts(project.id, Some(Phase::Spec))?;
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0].name, "prd.md");
        Ok(())
    }

    #[test]
    fn test_failed_batch_leaves_no_artifacts() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Atomic", "", None)?;
        let result = db.insert_artifacts(
            project.id + 100,
            &[doc(Phase::Analysis, "project-brief.md", "# B")],
        );
        assert!(result.is_err(), "foreign key violation expected");
        assert!(db.latest_artifacts(project.id + 100, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_record_approval_appends() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let project = db.create_project("Approve", "", None)?;
        let docs = [
            doc(Phase::StackSelection, "stack-decision.md", "# D1"),
            doc(Phase::StackSelection, "stack-rationale.md", "# R1"),
        ];
        let (sel1, arts1, updated) = db.record_approval(
            project.id,
            ApprovalKind::Stack,
            &serde_json::json!({"preset": "one"}),
            &docs,
        )?;
        assert!(updated.stack_approved);
        assert!(!updated.dependencies_approved);
        assert_eq!(arts1[0].version, 1);

        let (sel2, arts2, _) = db.record_approval(
            project.id,
            ApprovalKind::Stack,
            &serde_json::json!({"preset": "two"}),
            &docs,
        )?;
        assert!(sel2.id > sel1.id);
        assert_eq!(arts2[0].version, 2);
        assert_eq!(db.count_selections(project.id, ApprovalKind::Stack)?, 2);
        let latest = db.latest_selection(project.id, ApprovalKind::Stack)?.unwrap();
        assert_eq!(latest.payload["preset"], "two");
        assert!(
            db.latest_selection(project.id, ApprovalKind::Dependencies)?
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn test_users_and_roles() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        let admin = db
            .create_user("root@example.com", "Root", Role::Admin, "h1")?
            .unwrap();
        assert!(admin.is_admin());
        assert!(
            db.create_user("root@example.com", "Dup", Role::User, "h2")?
                .is_none()
        );
        let user = db
            .create_user("u@example.com", "U", Role::User, "h3")?
            .unwrap();
        assert_eq!(db.count_admins()?, 1);

        let promoted = db.update_user_role(user.id, Role::Admin)?.unwrap();
        assert_eq!(promoted.role, Role::Admin);
        assert_eq!(db.count_admins()?, 2);
        assert!(db.update_user_role(999, Role::User)?.is_none());

        let found = db.get_user_by_key_hash("h3")?.unwrap();
        assert_eq!(found.email, "u@example.com");
        assert!(db.get_user_by_key_hash("nope")?.is_none());
        assert_eq!(db.list_users()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_settings_crud() -> Result<()> {
        let db = SpecflowDb::new_in_memory()?;
        assert!(db.get_setting("theme")?.is_none());
        db.set_setting("theme", "dark")?;
        let updated = db.set_setting("theme", "light")?;
        assert_eq!(updated.value, "light");
        db.set_setting("analytics", "off")?;
        let keys: Vec<String> = db.list_settings()?.into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["analytics", "theme"]);
        assert!(db.delete_setting("theme")?);
        assert!(!db.delete_setting("theme")?);
        Ok(())
    }
}
