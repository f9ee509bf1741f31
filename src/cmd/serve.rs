//! `specflow serve` and `specflow migrate`.

use anyhow::{Context, Result};
use specflow::server::{self, ServerConfig};

use super::load_config;

pub async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let config = load_config()?;
    server::start_server(config, ServerConfig { host, port }).await
}

/// Opening the database applies any pending migrations.
pub fn cmd_migrate() -> Result<()> {
    let config = load_config()?;
    config
        .database
        .open()
        .with_context(|| format!("Failed to migrate {}", config.database))?;
    tracing::info!(database = %config.database, "Migrations applied");
    println!("Database ready at {}", config.database);
    Ok(())
}
