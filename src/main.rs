use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "specflow")]
#[command(version, about = "Spec-driven project orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        #[arg(long, env = "HOST", default_value = "127.0.0.1")]
        host: String,

        #[arg(long, env = "PORT", default_value = "3000")]
        port: u16,
    },
    /// Create the database and apply migrations
    Migrate,
    /// Validate the environment and print a redacted summary
    CheckEnv,
    /// Show the phase specification in effect
    Phases,
    /// Register a user and print their API key
    CreateUser {
        #[arg(long)]
        email: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    cmd::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(host, port).await?,
        Commands::Migrate => cmd::cmd_migrate()?,
        Commands::CheckEnv => cmd::cmd_check_env()?,
        Commands::Phases => cmd::cmd_phases()?,
        Commands::CreateUser { email, name, admin } => {
            cmd::cmd_create_user(&email, &name, admin)?
        }
    }

    Ok(())
}
