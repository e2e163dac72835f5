//! Process entry point for the duel match engine.
//!
//! Loads [`MatchConfig`], installs a `tracing` subscriber, and starts the
//! composition root (`duel_runtime::Engine`) plus its tick-driving loop.
//! Transport — how match creation and action submission actually reach this
//! process — is out of scope here (spec §0): this binary is the process
//! that would sit behind such a transport, the way `echo-kernel::Kernel`
//! sits behind `jitosd`'s HTTP routes, minus the HTTP layer itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use duel_clock::{ClockSource, SystemClock};
use duel_config::MatchConfig;
use duel_ids::MatchId;
use duel_runtime::Engine;
use duel_settlement::{Confirmation, SettlementBackend, SettlementError, SettlementPayload, SettlementPolicy, SettlementStatus};
use duel_telemetry::{Sink, TracingSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Duel match engine daemon")]
struct Args {
    /// Path to a TOML match configuration. Falls back to `MatchConfig::defaults()` if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `duel_match=debug,info`.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

/// Settlement backend stub: records every payout request to the logs and
/// confirms it immediately.
///
/// The concrete chain/rollup settlement substrate is out of scope per spec
/// §0; this is what a deployment plugs a real [`SettlementBackend`] in place
/// of.
#[derive(Default)]
struct LoggingSettlementBackend;

impl SettlementBackend for LoggingSettlementBackend {
    async fn submit(&self, payload: &SettlementPayload) -> Result<Confirmation, SettlementError> {
        info!(
            match_id = %payload.match_id,
            player_one_amount = payload.split.player_one_amount,
            player_two_amount = payload.split.player_two_amount,
            house_share = payload.split.house_share,
            "settlement payload submitted (logging backend, no real payout)"
        );
        Ok(Confirmation { tx_id: format!("log-{}", payload.match_id) })
    }

    async fn status(&self, _match_id: MatchId) -> SettlementStatus {
        SettlementStatus::NotFound
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            MatchConfig::from_toml(&text).context("parsing match config")?
        }
        None => MatchConfig::defaults(),
    };

    info!(
        duration_ticks = config.duration_ticks,
        tick_period_ms = config.tick_period_ms,
        house_edge = config.house_edge,
        "starting duel-serviced"
    );

    let backend = Arc::new(LoggingSettlementBackend);
    let policy = SettlementPolicy::from_config(&config);
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock::new());
    let sink: Arc<dyn Sink> = Arc::new(TracingSink);

    let engine = Engine::new("duel-serviced", backend, policy, clock, sink);
    let driver = Arc::clone(&engine).spawn_driver(Duration::from_millis(config.tick_period_ms));

    tokio::signal::ctrl_c().await.context("installing ctrl-c handler")?;
    info!("shutdown signal received");
    driver.abort();

    Ok(())
}
