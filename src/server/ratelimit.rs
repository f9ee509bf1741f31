//! Fixed-window request rate limiting.
//!
//! Each caller gets `limit` requests per one-minute window. Phase execution
//! has its own, smaller budget. A denied request is answered by the
//! middleware and never reaches a handler.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;

use super::api::{ApiError, SharedState};
use super::auth::{bearer_token, hash_api_key};

const WINDOW: Duration = Duration::from_secs(60);
/// Expired windows are swept, at most once per window, once the table grows
/// past this.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::with_window(limit, WINDOW)
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.limit {
            let left = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            // Round up so clients never retry a moment too early.
            let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
            return Decision::Denied {
                retry_after_secs: secs.max(1),
            };
        }
        entry.count += 1;
        Decision::Allowed {
            remaining: self.limit - entry.count,
        }
    }

    fn sweep(&self, now: Instant) {
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last) < self.window {
            return;
        }
        *last = now;
        let window = self.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// The general budget and the phase-execution budget.
#[derive(Debug)]
pub struct RateLimits {
    pub general: RateLimiter,
    pub execute: RateLimiter,
}

impl RateLimits {
    pub fn per_minute(general: u32, execute: u32) -> Self {
        Self {
            general: RateLimiter::per_minute(general),
            execute: RateLimiter::per_minute(execute),
        }
    }
}

/// Key for callers without a recognised API key: the first
/// `x-forwarded-for` hop, else one shared anonymous bucket.
pub fn network_key(headers: &HeaderMap) -> String {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return format!("ip:{}", ip);
    }
    "anonymous".to_string()
}

fn is_execute(method: &Method, path: &str) -> bool {
    method == Method::POST && path.starts_with("/api/projects/") && path.ends_with("/execute")
}

/// A bearer token earns its own bucket only when it belongs to a user.
/// Unknown tokens are charged to the network key so rotating them buys
/// nothing.
async fn caller_key(state: &SharedState, headers: &HeaderMap) -> String {
    let Some(token) = bearer_token(headers) else {
        return network_key(headers);
    };
    let hash = hash_api_key(&state.auth_secret, token);
    let lookup = hash.clone();
    match state
        .db
        .call(move |db| db.get_user_by_key_hash(&lookup))
        .await
    {
        Ok(Some(_)) => format!("key:{}", hash),
        Ok(None) => network_key(headers),
        Err(e) => {
            tracing::warn!(error = %e, "API key lookup failed during rate limiting");
            network_key(headers)
        }
    }
}

pub async fn enforce(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let key = caller_key(&state, request.headers()).await;
    let limiter = if is_execute(request.method(), request.uri().path()) {
        &state.limits.execute
    } else {
        &state.limits.general
    };

    match limiter.check(&key) {
        Decision::Denied { retry_after_secs } => {
            tracing::warn!(
                caller = %key.chars().take(16).collect::<String>(),
                path = %request.uri().path(),
                retry_after_secs,
                "Rate limit exceeded"
            );
            ApiError::RateLimited {
                retry_after_secs,
                limit: limiter.limit(),
            }
            .into_response()
        }
        Decision::Allowed { remaining } => {
            let limit = limiter.limit();
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
    }
}
