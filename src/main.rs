//! Relaybot CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "relaybot", version)]
#[command(about = "Multi-bot Slack message-forwarding relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Write logs to rolling daily files in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor: one listener per bot identity plus the
    /// forwarder workers (default when no subcommand is given)
    Start,
    /// Run a single ingest listener under one bot identity
    Listener {
        /// Bot index to run as (1-based)
        #[arg(long)]
        bot: u32,
    },
    /// Run a forwarder worker
    Worker,
    /// Print the channel → bot assignment report
    Assignments,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_dir.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    let command = cli.command.unwrap_or(Command::Start);

    runtime.block_on(async {
        let mut config = relaybot::config::Config::load()?;

        match command {
            Command::Start => relaybot::supervisor::run(config).await,
            Command::Listener { bot } => {
                if config.bot(bot).is_none() {
                    anyhow::bail!("bot {bot} is not configured ({} bots known)", config.bots.len());
                }
                config.current_bot_id = bot;
                relaybot::listener::run(config).await
            }
            Command::Worker => relaybot::worker::run(config).await,
            Command::Assignments => print_assignment_report(&config),
        }
    })
}

fn init_tracing(debug: bool, log_dir: Option<&Path>) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "relaybot.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leak the guard so the non-blocking writer lives for the
            // entire process.
            std::mem::forget(guard);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .compact(),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
    }
}

/// Administrative report: how discovery channels are spread across bots.
fn print_assignment_report(config: &relaybot::config::Config) -> anyhow::Result<()> {
    let table = relaybot::assign::AssignmentTable::load(
        config.assignment_path(),
        config.bots.len() as u32,
    );

    println!(
        "{} channels assigned across {} bots",
        table.len(),
        table.total_bots()
    );

    let mut distribution: Vec<(u32, usize)> = table.distribution().into_iter().collect();
    distribution.sort();
    for (bot_id, count) in distribution {
        println!("  Bot-{bot_id}: {count} channels");
    }

    let current = config.current_bot();
    let mine = table.channels_for(current.bot_id);
    println!("\n{} channels assigned to {}:", mine.len(), current.name);
    for channel_id in mine {
        println!("  {channel_id}");
    }

    Ok(())
}
