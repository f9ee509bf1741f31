//! Process configuration, read from the environment once at start-up.
//!
//! Every variable is validated eagerly and all problems are reported
//! together, so a misconfigured deployment fails before it binds a port.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::errors::ConfigError;
use crate::llm::{LlmConfig, LlmProvider};
use crate::store::SpecflowDb;

pub const MIN_AUTH_SECRET_LEN: usize = 32;
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ARTIFACTS_DIR: &str = ".specflow/artifacts";
const DEFAULT_RATE_LIMIT: u32 = 120;
const DEFAULT_EXECUTE_RATE_LIMIT: u32 = 10;

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

impl DatabaseLocation {
    /// Accepts `sqlite::memory:`, `sqlite://<path>`, `sqlite:<path>` or a
    /// bare path.
    pub fn parse(url: &str) -> Result<Self, String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("DATABASE_URL is required".to_string());
        }
        if url == "sqlite::memory:" || url == ":memory:" {
            return Ok(Self::Memory);
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        if path.is_empty() {
            return Err(format!("DATABASE_URL '{}' has no path", url));
        }
        if path.contains("://") {
            return Err(format!(
                "DATABASE_URL '{}' is not a SQLite URL (expected sqlite://<path>)",
                url
            ));
        }
        Ok(Self::File(PathBuf::from(path)))
    }

    /// Open the database, creating parent directories for file databases.
    pub fn open(&self) -> Result<SpecflowDb> {
        match self {
            Self::Memory => SpecflowDb::new_in_memory(),
            Self::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                SpecflowDb::new(path)
            }
        }
    }
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("sqlite::memory:"),
            Self::File(path) => write!(f, "sqlite://{}", path.display()),
        }
    }
}

/// Object-storage credentials. Validated only; artifacts stay on disk.
#[derive(Clone)]
pub struct StorageCredentials {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// OAuth client credentials. Validated only.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone)]
pub struct Config {
    pub database: DatabaseLocation,
    pub auth_secret: String,
    pub public_app_url: String,
    pub llm: LlmConfig,
    pub artifacts_dir: PathBuf,
    pub phase_spec_path: Option<PathBuf>,
    pub rate_limit_per_minute: u32,
    pub execute_rate_limit_per_minute: u32,
    pub storage: Option<StorageCredentials>,
    pub oauth: Option<OAuthCredentials>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database", &self.database)
            .field("auth_secret", &"<redacted>")
            .field("public_app_url", &self.public_app_url)
            .field("llm", &self.llm)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("phase_spec_path", &self.phase_spec_path)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field(
                "execute_rate_limit_per_minute",
                &self.execute_rate_limit_per_minute,
            )
            .field("storage", &self.storage.as_ref().map(|s| &s.endpoint))
            .field("oauth", &self.oauth.as_ref().map(|_| "<configured>"))
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut problems = Vec::new();

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseLocation::parse(&url)
                .map_err(|e| problems.push(e))
                .ok(),
            None => {
                problems.push("DATABASE_URL is required".to_string());
                None
            }
        };

        let auth_secret = match get("AUTH_SECRET") {
            Some(secret) if secret.chars().count() >= MIN_AUTH_SECRET_LEN => Some(secret),
            Some(_) => {
                problems.push(format!(
                    "AUTH_SECRET must be at least {} characters",
                    MIN_AUTH_SECRET_LEN
                ));
                None
            }
            None => {
                problems.push("AUTH_SECRET is required".to_string());
                None
            }
        };

        let public_app_url = match get("PUBLIC_APP_URL") {
            Some(url) => check_http_url("PUBLIC_APP_URL", &url)
                .map(|_| url.trim_end_matches('/').to_string())
                .map_err(|e| problems.push(e))
                .ok(),
            None => {
                problems.push("PUBLIC_APP_URL is required".to_string());
                None
            }
        };

        let provider = match get("LLM_PROVIDER") {
            Some(p) => p.parse::<LlmProvider>().map_err(|e| problems.push(e)).ok(),
            None => Some(LlmProvider::Anthropic),
        };
        let api_key = get("ANTHROPIC_API_KEY");
        if provider == Some(LlmProvider::Anthropic) && api_key.is_none() {
            problems.push("ANTHROPIC_API_KEY is required (or set LLM_PROVIDER=stub)".to_string());
        }
        let base_url = get("LLM_BASE_URL");
        if let Some(url) = &base_url
            && let Err(e) = check_http_url("LLM_BASE_URL", url)
        {
            problems.push(e);
        }
        let timeout_secs = positive_u64(&get, "LLM_TIMEOUT_SECS", DEFAULT_LLM_TIMEOUT_SECS, &mut problems);

        let rate_limit_per_minute =
            positive_u32(&get, "RATE_LIMIT_PER_MINUTE", DEFAULT_RATE_LIMIT, &mut problems);
        let execute_rate_limit_per_minute = positive_u32(
            &get,
            "EXECUTE_RATE_LIMIT_PER_MINUTE",
            DEFAULT_EXECUTE_RATE_LIMIT,
            &mut problems,
        );

        let storage = all_or_none(
            &get,
            &[
                "STORAGE_ENDPOINT",
                "STORAGE_BUCKET",
                "STORAGE_ACCESS_KEY_ID",
                "STORAGE_SECRET_ACCESS_KEY",
            ],
            &mut problems,
        )
        .and_then(|mut values| {
            let secret_access_key = values.pop()?;
            let access_key_id = values.pop()?;
            let bucket = values.pop()?;
            let endpoint = values.pop()?;
            if let Err(e) = check_http_url("STORAGE_ENDPOINT", &endpoint) {
                problems.push(e);
                return None;
            }
            Some(StorageCredentials {
                endpoint,
                bucket,
                access_key_id,
                secret_access_key,
            })
        });

        let oauth = all_or_none(&get, &["OAUTH_CLIENT_ID", "OAUTH_CLIENT_SECRET"], &mut problems)
            .and_then(|mut values| {
                let client_secret = values.pop()?;
                let client_id = values.pop()?;
                Some(OAuthCredentials {
                    client_id,
                    client_secret,
                })
            });

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        match (database, auth_secret, public_app_url, provider) {
            (Some(database), Some(auth_secret), Some(public_app_url), Some(provider)) => Ok(Self {
                database,
                auth_secret,
                public_app_url,
                llm: LlmConfig {
                    provider,
                    api_key,
                    base_url,
                    timeout: Duration::from_secs(timeout_secs),
                },
                artifacts_dir: get("ARTIFACTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
                phase_spec_path: get("PHASE_SPEC_PATH").map(PathBuf::from),
                rate_limit_per_minute,
                execute_rate_limit_per_minute,
                storage,
                oauth,
            }),
            _ => Err(ConfigError::Invalid(vec![
                "configuration incomplete".to_string(),
            ])),
        }
    }

    pub fn phase_spec_path(&self) -> Option<&Path> {
        self.phase_spec_path.as_deref()
    }

    /// Human-readable, secret-free description for `check-env`.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let llm_provider = match self.llm.provider {
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Stub => "stub",
        };
        vec![
            ("database", self.database.to_string()),
            ("public_app_url", self.public_app_url.clone()),
            ("llm_provider", llm_provider.to_string()),
            (
                "llm_base_url",
                self.llm
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "(default)".to_string()),
            ),
            ("llm_timeout_secs", self.llm.timeout.as_secs().to_string()),
            ("artifacts_dir", self.artifacts_dir.display().to_string()),
            (
                "phase_spec",
                self.phase_spec_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(built-in)".to_string()),
            ),
            ("rate_limit_per_minute", self.rate_limit_per_minute.to_string()),
            (
                "execute_rate_limit_per_minute",
                self.execute_rate_limit_per_minute.to_string(),
            ),
            (
                "object_storage",
                self.storage
                    .as_ref()
                    .map(|s| format!("{} ({})", s.endpoint, s.bucket))
                    .unwrap_or_else(|| "disabled".to_string()),
            ),
            (
                "oauth",
                if self.oauth.is_some() { "configured" } else { "disabled" }.to_string(),
            ),
        ]
    }
}

fn check_http_url(key: &str, value: &str) -> Result<(), String> {
    match reqwest::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        Ok(_) => Err(format!("{} must be an http(s) URL, got '{}'", key, value)),
        Err(e) => Err(format!("{} is not a valid URL: {}", key, e)),
    }
}

fn positive_u64<G>(get: &G, key: &str, default: u64, problems: &mut Vec<String>) -> u64
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => {
                problems.push(format!("{} must be a positive integer, got '{}'", key, raw));
                default
            }
        },
    }
}

fn positive_u32<G>(get: &G, key: &str, default: u32, problems: &mut Vec<String>) -> u32
where
    G: Fn(&str) -> Option<String>,
{
    let value = positive_u64(get, key, u64::from(default), problems);
    match u32::try_from(value) {
        Ok(n) => n,
        Err(_) => {
            problems.push(format!("{} is too large", key));
            default
        }
    }
}

/// Either every key in the group is set or none is. Returns the values in
/// key order when all are set.
fn all_or_none<G>(get: &G, keys: &[&str], problems: &mut Vec<String>) -> Option<Vec<String>>
where
    G: Fn(&str) -> Option<String>,
{
    let values: Vec<Option<String>> = keys.iter().map(|&k| get(k)).collect();
    let set = values.iter().filter(|v| v.is_some()).count();
    if set == 0 {
        return None;
    }
    if set < keys.len() {
        let missing: Vec<&str> = keys
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| *k)
            .collect();
        problems.push(format!(
            "{} must be set together; missing {}",
            keys.join(", "),
            missing.join(", ")
        ));
        return None;
    }
    values.into_iter().collect()
}
