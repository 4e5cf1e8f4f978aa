use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fundwatch_adapters::global_registry;
use fundwatch_core::Opportunity;
use fundwatch_sync::{open_store, render_message_text, AppConfig, PreviewHook, SourceDisplayNames, SyncPipeline};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_RUN_ERRORS: u8 = 1;
const EXIT_SETUP_ERROR: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "fundwatch")]
#[command(about = "Watch funding sources and post new opportunities to Slack")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides the configured log level (RUST_LOG wins when set).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every source once and post new matches.
    Run,
    /// Fetch once and print what would be posted.
    DryRun,
    /// Create the dedupe database schema.
    InitDb,
    /// Record everything currently listed as seen, without posting.
    Backfill {
        /// Required safety flag.
        #[arg(long)]
        mark_seen: bool,
    },
    /// List the registered source types.
    Sources,
}

struct StdoutPreview {
    display_names: SourceDisplayNames,
}

impl PreviewHook for StdoutPreview {
    fn preview(&self, opportunity: &Opportunity, match_reason: &str) {
        let display = self.display_names.get(&opportunity.source_id);
        println!("[DRY RUN] WOULD POST TEXT:");
        println!("{}", render_message_text(opportunity, match_reason, display));
        println!();
    }
}

fn init_tracing(level: &str) {
    let default_directive = match level.trim().to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Sources = cli.command {
        for source_type in global_registry().registered_types() {
            println!("{source_type}");
        }
        return ExitCode::SUCCESS;
    }

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Config error: {err}");
            return ExitCode::from(EXIT_SETUP_ERROR);
        }
    };
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Setup error: {err:#}");
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}

async fn execute(command: Commands, mut config: AppConfig) -> Result<ExitCode> {
    if let Commands::Backfill { mark_seen: false } = command {
        eprintln!("backfill requires --mark-seen");
        return Ok(ExitCode::from(EXIT_SETUP_ERROR));
    }

    let store = open_store(&config).await?;
    if let Commands::InitDb = command {
        info!(path = %config.storage.path.display(), "initialized SQLite database");
        store.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    let backfill = matches!(command, Commands::Backfill { .. });
    if backfill || matches!(command, Commands::DryRun) {
        config.posting.dry_run = true;
    }

    let store = Arc::new(store);
    let mut pipeline = SyncPipeline::from_config(&config, store.clone())?;

    let ok = if backfill {
        pipeline.backfill().await.ok()
    } else {
        if config.posting.dry_run {
            pipeline = pipeline.with_preview(Box::new(StdoutPreview {
                display_names: SourceDisplayNames::from_sources(&config.sources),
            }));
        }
        pipeline.run_once().await.ok()
    };
    store.close().await;

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_RUN_ERRORS)
    })
}
