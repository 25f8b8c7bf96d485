//! Synheart Sleep Agent CLI
//!
//! Corrected sleep boundaries and nightly trends from wearable telemetry.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use synheart_sleep_agent::{
    Config, FileStore, InboxSource, RecalcOutcome, SleepAgent, SystemClock, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "synheart-sleep")]
#[command(author = "Synheart")]
#[command(version = VERSION)]
#[command(about = "Corrected sleep boundaries and nightly trends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until Ctrl+C
    Start,

    /// Recalculate the last night from the stored payload
    Recalc,

    /// Show pending state, buffer size and the latest night
    Status,

    /// Print the nightly history
    History {
        /// Only the most recent N entries
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config, using defaults: {e}");
        Config::default()
    });

    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::Recalc => cmd_recalc(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::History { limit } => cmd_history(config, limit).await,
        Commands::Config => cmd_config(&config),
    }
}

fn build_agent(config: Config) -> anyhow::Result<Arc<SleepAgent>> {
    config
        .ensure_directories()
        .context("Could not create data directories")?;
    let config = Arc::new(config);
    Ok(Arc::new(SleepAgent::new(
        config.clone(),
        Arc::new(FileStore::new(config.state_path())),
        Arc::new(InboxSource::new(config.inbox_path())),
        Arc::new(SystemClock),
    )))
}

async fn cmd_start(config: Config) -> anyhow::Result<()> {
    println!("Synheart Sleep Agent v{VERSION}");
    println!();
    println!("  Inbox: {:?}", config.inbox_path());
    println!("  Timezone: {}", config.timezone.name());
    println!("  Refresh interval: {} min", config.refresh_interval_minutes);
    println!(
        "  Live corroboration: {}",
        if config.live_corroboration {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let agent = build_agent(config)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("Error setting Ctrl+C handler")?;

    agent.run(shutdown_rx).await?;
    println!("Stopped.");
    Ok(())
}

async fn cmd_recalc(config: Config) -> anyhow::Result<()> {
    let agent = build_agent(config)?;
    agent.restore().await?;

    match agent.recalculate().await? {
        RecalcOutcome::AlreadyRunning => println!("A recalculation is already running."),
        RecalcOutcome::NoPayload => {
            println!("No sleep payload stored yet.");
            println!("Run 'synheart-sleep start' to fetch one.");
        }
        RecalcOutcome::NoMainSleep => println!("The last payload has no usable main sleep."),
        RecalcOutcome::Checked(outcome) => println!("{outcome:#?}"),
    }
    Ok(())
}

async fn cmd_status(config: Config) -> anyhow::Result<()> {
    let agent = build_agent(config)?;
    agent.restore().await?;
    let status = agent.status().await?;

    println!("Synheart Sleep Agent Status");
    println!("===========================");
    println!();
    println!(
        "Heart-rate buffer: {} persisted, {} working",
        status.persisted_points, status.working_points
    );
    match &status.pending {
        Some(record) => println!("Pending main sleep: {} to {}", record.start, record.end),
        None => println!("Pending main sleep: none"),
    }
    println!();

    match status.latest {
        Some(entry) => {
            println!("Latest night ({}):", entry.date);
            println!("  Fell asleep: {} ({})", entry.fell_asleep_at, entry.sleep_source);
            println!("  Woke up: {}", entry.woke_up_at);
            println!("  Minutes asleep: {}", entry.minutes_asleep);
            if let Some(drop) = entry.hr_drop {
                println!("  Heart-rate drop: {drop:.1} bpm");
            }
        }
        None => println!("No nights recorded yet."),
    }
    Ok(())
}

async fn cmd_history(config: Config, limit: Option<usize>) -> anyhow::Result<()> {
    let agent = build_agent(config)?;
    let history = agent.history().await?;
    let entries = history.entries();
    let shown = &entries[entries.len().saturating_sub(limit.unwrap_or(entries.len()))..];

    if shown.is_empty() {
        println!("No nights recorded yet.");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(shown)?);
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
