use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kajin_adapters::Source;
use kajin_sync::{RunMode, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_TARGETS: [&str; 4] = ["kajin_cli", "kajin_sync", "kajin_storage", "kajin_adapters"];

#[derive(Debug, Parser)]
#[command(name = "kajin")]
#[command(about = "Resolve rental listings to their source links and clean out expired ones")]
struct Cli {
    /// Debug-level logging for the kajin crates.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the current listings, resolve new ones and update the stores.
    Sync(SyncArgs),
    /// Print the known sources and how each one signals expiration.
    Sources,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Re-check every listing and remove the expired ones.
    #[arg(long)]
    expired: bool,

    /// Drop the link cache before resolving.
    #[arg(long)]
    rebuild_cache: bool,

    #[arg(long, env = "KAJIN_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "KAJIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "KAJIN_DATABASES_DIR")]
    databases_dir: Option<PathBuf>,

    #[arg(long, env = "KAJIN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

fn init_logger(verbose: bool, json: bool, run_log: Option<File>) {
    let level = if verbose { "debug" } else { "info" };
    let directives = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{directives}")));

    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let file_layer = run_log.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_target(false)
    });
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer);
    if json {
        registry.with(fmt.json()).init();
    } else {
        registry.with(fmt.compact()).init();
    }
}

fn sync_config(args: &mut SyncArgs) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    config.email = args.email.take().or(config.email);
    config.password = args.password.take().or(config.password);
    if let Some(dir) = args.databases_dir.take() {
        config.databases_dir = dir;
    }
    if let Some(dir) = args.data_dir.take() {
        config.data_dir = dir;
    }
    config
}

async fn sync(config: SyncConfig, args: SyncArgs) -> Result<()> {
    let mode = RunMode {
        sweep: args.expired,
        rebuild_cache: args.rebuild_cache,
    };
    info!(api = %config.api_base, sweep = mode.sweep, rebuild_cache = mode.rebuild_cache, "connecting");
    let pipeline = SyncPipeline::connect(config).await?;
    let summary = pipeline.run_once(mode).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "sync complete: run_id={} listings={} resolved={} cached={} newly_expired={} removed={} failed_reports={}",
            summary.run_id,
            summary.batch_size,
            summary.resolved,
            summary.from_cache,
            summary.newly_expired,
            summary.removed,
            summary.failed_reports
        );
    }
    Ok(())
}

fn print_sources() {
    for source in Source::all() {
        println!("{:<16} {}", source.id(), source.rule().mode_name());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(mut args) => {
            let config = sync_config(&mut args);
            init_logger(cli.verbose, cli.json_logs, Some(config.open_run_log()?));
            sync(config, args).await?;
        }
        Commands::Sources => {
            init_logger(cli.verbose, cli.json_logs, None);
            print_sources();
        }
    }

    Ok(())
}
