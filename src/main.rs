use clap::{Parser, Subcommand};

use identity_store::clock::Clock;
use identity_store::config::{purge_cutoff, MAX_RESET_TOKEN_RETENTION_HOURS};
use identity_store::db::{self, AppState};
use identity_store::reset::ResetTokenStore;
use identity_store::users::UserStore;

#[derive(Parser)]
#[command(name = "identity-store", about = "Schema and maintenance tasks for the identity store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Migrate,
    /// Re-run the schema script against an existing database
    ApplySchema,
    /// Delete reset tokens that expired more than N hours ago
    PurgeExpired {
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_RESET_TOKEN_RETENTION_HOURS))]
        retention_hours: Option<i64>,
    },
    /// Print user head counts as JSON
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "identity_store=debug,sqlx=warn".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let app_state = AppState::init().await?;

    match cli.command.unwrap_or(Command::Migrate) {
        Command::Migrate => {
            db::migrate(&app_state.db).await?;
            tracing::info!("migrations applied");
        }
        Command::ApplySchema => {
            db::apply_schema(&app_state.db).await?;
            tracing::info!("schema applied");
        }
        Command::PurgeExpired { retention_hours } => {
            let hours = retention_hours.unwrap_or(app_state.config.reset_token_retention_hours);
            let cutoff = purge_cutoff(app_state.clock.now(), hours)?;
            let purged = app_state.reset_tokens().purge_expired(cutoff).await?;
            tracing::info!(purged, %cutoff, "expired reset tokens purged");
        }
        Command::Stats => {
            let stats = app_state.users().stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
