//! HTTP server for the HTS query service

use anyhow::{Context, Result};
use clap::Parser;
use hts_query::api::{start_server, ApiState};
use hts_query::config::AppConfig;
use hts_query::pipeline::QueryPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hts-query-server")]
#[command(about = "Answer natural-language questions over the weekly HTS tables")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 8000)]
    port: u16,

    /// Column dictionary CSV (overrides DICTIONARY_PATH)
    #[arg(long)]
    dictionary: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Fails before any network activity if the API key or credentials are missing
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(dictionary) = args.dictionary {
        config.dictionary_path = dictionary;
    }

    info!(
        ssh_host = %config.tunnel.ssh_host,
        database = %config.database.database,
        model = %config.llm.model,
        dictionary = %config.dictionary_path.display(),
        "Starting HTS query service"
    );

    let pipeline = QueryPipeline::from_config(&config).context("Failed to build pipeline")?;
    let state = ApiState {
        pipeline: Arc::new(pipeline),
    };

    start_server(&args.host, args.port, state).await
}
