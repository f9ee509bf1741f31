//! HTTP surface: routes, authentication, rate limiting and start-up.

pub mod api;
pub mod app;
pub mod auth;
pub mod ratelimit;

pub use app::{ServerConfig, build_router, build_state, start_server};
