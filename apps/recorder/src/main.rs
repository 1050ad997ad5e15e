mod config;
mod driver;
mod host;
mod script;

use std::{io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use storage::Storage;
use tokio::io::BufReader;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    config::{load_settings, normalize_database_url},
    driver::Driver,
};

/// Replays a JSON-lines tab script against the recording tracker and prints
/// every outcome to stdout.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "recorder.toml")]
    config: PathBuf,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    log_filter: Option<String>,
    /// Read the script from a file instead of stdin.
    #[arg(long)]
    script: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config)?;
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if let Some(log_filter) = args.log_filter {
        settings.log_filter = log_filter;
    }

    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .with_writer(io::stderr)
        .init();

    let script = args.script;
    let run_id = Uuid::new_v4();
    async move {
        let database_url = normalize_database_url(&settings.database_url);
        let storage = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open store at '{database_url}'"))?;
        storage.health_check().await?;
        info!(%database_url, "store ready");

        let driver = Driver::new(
            Arc::new(storage),
            settings.outcome_buffer,
            settings.fire_create_on_ready,
            io::stdout(),
        );
        match script {
            Some(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("failed to open script '{}'", path.display()))?;
                driver.run(BufReader::new(file)).await?;
            }
            None => {
                driver.run(BufReader::new(tokio::io::stdin())).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .instrument(info_span!("recorder", %run_id))
    .await
}
