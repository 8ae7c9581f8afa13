//! mixtrack-lookup - find a Mixpanel profile by e-mail.
//!
//! Reads `mixpanel.api_secret` from the mixtrack config
//! (`MIXTRACK_CONFIG`, default `config/mixtrack.toml`).

use clap::Parser;
use mixtrack::query::{MixpanelQuery, QueryError};
use mixtrack::TrackConfig;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mixtrack-lookup", version, about = "Look up a Mixpanel profile by e-mail")]
struct Cli {
    /// E-mail address stored in the profile's $email
    email: String,

    /// Config file, overrides MIXTRACK_CONFIG
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrackConfig::load_from(path),
        None => TrackConfig::load(),
    };
    let query = match config.and_then(|c| MixpanelQuery::from_config(&c.mixpanel)) {
        Ok(query) => query,
        Err(e) => {
            error!(error = %e, "Cannot query Mixpanel");
            return ExitCode::FAILURE;
        }
    };

    match query.profile_by_email(&cli.email).await {
        Ok(Some(profile)) => {
            println!("{}", profile);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("no profile");
            ExitCode::SUCCESS
        }
        Err(e @ QueryError::MultipleProfiles { .. }) => {
            eprintln!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "Query failed");
            ExitCode::FAILURE
        }
    }
}
