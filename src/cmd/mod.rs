//! CLI command implementations.
//!
//! | Module   | Commands handled                 |
//! |----------|----------------------------------|
//! | `serve`  | `Serve`, `Migrate`               |
//! | `config` | `CheckEnv`, `Phases`             |
//! | `users`  | `CreateUser`                     |

pub mod config;
pub mod serve;
pub mod users;

pub use config::{cmd_check_env, cmd_phases};
pub use serve::{cmd_migrate, cmd_serve};
pub use users::cmd_create_user;

use anyhow::Result;
use specflow::config::Config;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "specflow=info,tower_http=info";

/// `RUST_LOG` filters; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Read and validate the environment, listing every problem on failure.
pub fn load_config() -> Result<Config> {
    Config::from_env().map_err(|e| {
        for problem in e.problems() {
            tracing::error!(problem = %problem, "Invalid configuration");
        }
        anyhow::Error::new(e)
    })
}
