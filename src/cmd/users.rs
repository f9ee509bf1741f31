//! `specflow create-user`.

use anyhow::{Context, Result, bail};
use specflow::server::auth::{generate_api_key, hash_api_key};
use specflow::store::Role;

use super::load_config;

pub fn cmd_create_user(email: &str, name: &str, admin: bool) -> Result<()> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        bail!("Invalid email '{}'", email);
    }
    let config = load_config()?;
    let db = config
        .database
        .open()
        .with_context(|| format!("Failed to open {}", config.database))?;

    let role = if admin { Role::Admin } else { Role::User };
    let api_key = generate_api_key();
    let hash = hash_api_key(&config.auth_secret, &api_key);
    let Some(user) = db.create_user(&email, name.trim(), role, &hash)? else {
        bail!("A user with email {} already exists", email);
    };

    tracing::info!(user_id = user.id, role = role.as_str(), "User created");
    println!("Created {} user {} (id {})", role.as_str(), user.email, user.id);
    println!();
    println!("API key (shown once, store it now):");
    println!("  {}", api_key);
    Ok(())
}
