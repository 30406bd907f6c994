//! # ladderbot
//!
//! ```text
//!  ladderbot live     [--paper-bars bars.csv]           poll loop + monitor server
//!  ladderbot backtest --bars bars.csv [--trades-out ..]  replay a CSV, print report
//!  ladderbot export   --out trades.csv [--archive]       dump the ledger
//! ```
//!
//! Configuration comes from the environment (and `.env`), see [`AppConfig`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ladderbot::broker::{Broker, Mt5Broker, PaperBroker};
use ladderbot::config::AppConfig;
use ladderbot::data::load_bars;
use ladderbot::driver::{BacktestDriver, LiveExecutionDriver, LiveSettings};
use ladderbot::engine::{ManagerSettings, PositionLifecycleManager};
use ladderbot::events::{BroadcastNotifier, Notifiers, TracingNotifier};
use ladderbot::risk::RiskManager;
use ladderbot::routes;
use ladderbot::state::AppState;
use ladderbot::store::export::export_trades_csv;
use ladderbot::store::JsonFileStore;
use ladderbot::strategy::MaCrossSource;

#[derive(Parser)]
#[command(name = "ladderbot", version, about = "Regime-adaptive exit ladder with broker reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live poll loop against the configured broker.
    Live {
        /// Seed the paper broker with these bars (only when MT5_BASE_URL=mock).
        #[arg(long)]
        paper_bars: Option<PathBuf>,
    },
    /// Replay a bar CSV through the lifecycle engine.
    Backtest {
        #[arg(long)]
        bars: PathBuf,
        #[arg(long)]
        trades_out: Option<PathBuf>,
    },
    /// Write the persisted ledger to CSV.
    Export {
        #[arg(long)]
        out: PathBuf,
        /// Also move closed groups out of the active store.
        #[arg(long)]
        archive: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ──────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ─────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("ladderbot=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(r#"

  ╔═══════════════════════════════════════════════════════╗
  ║           LADDERBOT — Position Lifecycle Engine       ║
  ║  Admission · Exit Ladder · Trailing · Reconciliation  ║
  ╚═══════════════════════════════════════════════════════╝"#);

    let cli = Cli::parse();

    // ── 3. Configuration ──────────────────────────────────────────────────────
    let config = AppConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Command::Live { paper_bars } => run_live(config, paper_bars).await,
        Command::Backtest { bars, trades_out } => run_backtest(&config, bars, trades_out),
        Command::Export { out, archive } => run_export(&config, out, archive),
    }
}

async fn run_live(config: AppConfig, paper_bars: Option<PathBuf>) -> anyhow::Result<()> {
    // ── Store ─────────────────────────────────────────────────────────────────
    let store = JsonFileStore::open(&config.state_dir, config.instrument)
        .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;
    let manager = PositionLifecycleManager::new(store, ManagerSettings::from_config(&config));
    info!(
        active = manager.active_groups()?.len(),
        dir    = %config.state_dir.display(),
        "💾 state loaded"
    );

    // ── Broker ────────────────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = if config.broker.is_mock() {
        let paper = match paper_bars {
            Some(path) => {
                let bars = load_bars(&path).with_context(|| format!("loading {}", path.display()))?;
                info!(bars = bars.len(), "📄 paper broker seeded");
                PaperBroker::with_bars(bars)
            }
            None => PaperBroker::new(),
        };
        warn!("🧪 MT5_BASE_URL=mock, orders go to the in-memory paper broker");
        Arc::new(paper)
    } else {
        if paper_bars.is_some() {
            warn!("--paper-bars ignored with a real broker");
        }
        Arc::new(Mt5Broker::new(config.broker.base_url.clone(), config.broker.timeout, config.bar_period))
    };

    // ── Shared state ──────────────────────────────────────────────────────────
    let risk = Arc::new(RiskManager::new(config.risk.clone()));
    let state = Arc::new(AppState::new(risk.clone(), config.api_key.clone()));
    let notifier = Arc::new(
        Notifiers::new()
            .with(Arc::new(TracingNotifier))
            .with(Arc::new(BroadcastNotifier::new(state.broadcast_tx.clone()))),
    );

    let driver = LiveExecutionDriver::new(
        LiveSettings::from_config(&config),
        manager,
        broker,
        Box::new(MaCrossSource::new(config.strategy)),
        config.regime,
        risk,
        notifier,
    )?
    .with_monitor(state.clone());

    // ── Shutdown signal ───────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, finishing current cycle");
        }
        let _ = stop_tx.send(true);
    });

    // ── Monitor server ────────────────────────────────────────────────────────
    if let Some(addr) = config.monitor_addr {
        let app = routes::router(state);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding monitor on {addr}"))?;
        let mut shutdown = stop_rx.clone();
        info!(?addr, "🚀 monitor server starting");
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "monitor server stopped");
            }
        });
    }

    driver.run(stop_rx).await?;
    Ok(())
}

fn run_backtest(config: &AppConfig, bars: PathBuf, trades_out: Option<PathBuf>) -> anyhow::Result<()> {
    let bars = load_bars(&bars).with_context(|| format!("loading {}", bars.display()))?;
    let source = MaCrossSource::new(config.strategy);
    let driver = BacktestDriver::new(ManagerSettings::from_config(config), config.regime, &source);

    let report = driver.run(&bars)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = trades_out {
        export_trades_csv(&path, &report.records)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(records = report.records.len(), path = %path.display(), "📤 trades exported");
    }
    Ok(())
}

fn run_export(config: &AppConfig, out: PathBuf, archive: bool) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&config.state_dir, config.instrument)
        .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;
    let mut manager = PositionLifecycleManager::new(store, ManagerSettings::from_config(config));

    let records = manager.trade_records()?;
    export_trades_csv(&out, &records).with_context(|| format!("writing {}", out.display()))?;
    info!(records = records.len(), path = %out.display(), "📤 ledger exported");

    if archive {
        let archived = manager.archive_closed()?;
        info!(groups = archived.len(), "🗄️ closed groups archived");
    }
    Ok(())
}
