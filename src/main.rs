use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use viewtally::agent::Agent;
use viewtally::clock::Clock;
use viewtally::config::Config;
use viewtally::queue::flush::FlushReport;
use viewtally::report;

/// Buffered page-view analytics: flushes counter buffers into per-day rows.
#[derive(Parser)]
#[command(name = "viewtally", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Flush on an interval until SIGINT/SIGTERM (default).
    Run,
    /// Run a single flush of both queues and exit.
    Flush {
        /// Date to attribute flushed counts to (YYYY-MM-DD). Default: today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print persisted rows for a date.
    Show {
        /// Date to show (YYYY-MM-DD). Default: today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("viewtally {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            tracing::info!("no --config given, using defaults");
            Config::default()
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            None | Some(Command::Run) => run(cfg).await,
            Some(Command::Flush { date }) => flush(cfg, date).await,
            Some(Command::Show { date }) => show(cfg, date).await,
            Some(Command::Version) => Ok(()),
        }
    })
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting viewtally",
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("viewtally stopped");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler, SIGINT only");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

async fn flush(cfg: Config, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Clock::from(cfg.timezone).today());
    let (page_queue, browser_queue) = (cfg.buffer.page_queue.clone(), cfg.buffer.browser_queue.clone());

    let agent = Agent::new(cfg)?;
    agent.connect().await?;

    let summary = agent.flush_once_for(date).await?;
    print_report(&page_queue, &summary.page);
    print_report(&browser_queue, &summary.browser);

    Ok(())
}

fn print_report(queue: &str, report: &FlushReport) {
    println!(
        "{queue}: {} entries, {} views, {} malformed{}",
        report.entries,
        report.total,
        report.anomalies,
        if report.recovered {
            ", recovered aborted drain"
        } else {
            ""
        }
    );
}

async fn show(cfg: Config, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Clock::from(cfg.timezone).today());

    let agent = Agent::new(cfg)?;
    agent.connect().await?;
    let store = agent.store();

    let pages = store.page_rows(date).await?;
    println!("page views for {date}");
    for row in &pages {
        let d = &row.dimension;
        println!(
            "{:>8}  {}{}  referrer={}{}  utm={}",
            row.total,
            d.site.as_deref().unwrap_or("-"),
            d.page.as_deref().unwrap_or(""),
            d.referrer_host.as_deref().unwrap_or("-"),
            d.referrer_path.as_deref().unwrap_or(""),
            [
                d.utm.source.as_deref(),
                d.utm.medium.as_deref(),
                d.utm.campaign.as_deref(),
                d.utm.term.as_deref(),
                d.utm.content.as_deref(),
            ]
            .map(|v| v.unwrap_or("-"))
            .join("/"),
        );
    }

    let browsers = store.browser_rows(date).await?;
    println!("\nbrowsers for {date}");
    for row in &browsers {
        let d = &row.dimension;
        println!(
            "{:>8}  {}  {} {}",
            row.total,
            d.site.as_deref().unwrap_or("-"),
            d.name.as_deref().unwrap_or("-"),
            d.version.as_deref().unwrap_or("-"),
        );
    }

    let overview = report::utm_overview(&pages);
    println!(
        "\ncampaigns: {} of {} views ({}%) from {} sources, {} campaigns",
        overview.utm_views,
        overview.total_views,
        overview.utm_percentage,
        overview.unique_sources,
        overview.unique_campaigns,
    );
    for perf in report::campaign_performance(&pages) {
        println!(
            "{:>8}  {}  {}  {} pages, {} per page",
            perf.total,
            perf.campaign,
            perf.source_medium(),
            perf.pages_count,
            perf.avg_per_page,
        );
    }

    Ok(())
}
