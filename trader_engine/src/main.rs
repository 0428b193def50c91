/// main.rs — Trader entry point
///
/// FLOW:
///   1. Load config from .env / environment
///   2. Build one ModelContext per enabled model (own OKX client + provider)
///   3. Open the balance history store and warm each model's account view
///   4. Probe balances and apply default leverage per instrument
///      (failures are logged, never fatal)
///   5. Run the aligned scheduler forever
///
/// Orders are only sent with TRADER_DRY_RUN=false.
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trader_engine::config::AppConfig;
use trader_engine::context::{Freshness, ModelContext};
use trader_engine::decision::{ChatCompletionsProvider, NoSentiment};
use trader_engine::exchange::OkxClient;
use trader_engine::execution::{ExecutionEngine, ExecutionLock};
use trader_engine::history::BalanceHistoryStore;
use trader_engine::scheduler::Scheduler;
use trader_engine::sizing::PositionSizer;

/// Balance points replayed into each model at startup.
const WARM_POINTS: usize = 500;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║     TRADER  —  OKX PERPETUAL SWAPS          ║");
    info!("╚══════════════════════════════════════════════╝");

    // ── Config ───────────────────────────────────────────────────────────
    let AppConfig { models, symbols, sizing, execution, scheduler, exchange, storage } = AppConfig::from_env()?;
    if execution.dry_run {
        info!("dry run: decisions are planned and logged, no orders are sent");
    } else {
        warn!("⚠️  LIVE ORDERS ENABLED — real funds at risk");
    }
    if exchange.simulated {
        info!("demo trading header enabled");
    }

    // ── History ──────────────────────────────────────────────────────────
    let history = BalanceHistoryStore::open(&storage.db_path, &storage.archive_dir)
        .with_context(|| format!("opening balance history at {}", storage.db_path.display()))?;

    // ── Models ───────────────────────────────────────────────────────────
    let mut contexts = Vec::with_capacity(models.len());
    for model in models {
        let client = OkxClient::new(model.credentials, &exchange)
            .with_context(|| format!("building exchange client for {}", model.key))?;
        let provider = ChatCompletionsProvider::new(model.provider)
            .with_context(|| format!("building decision provider for {}", model.key))?;
        let ctx = ModelContext::new(
            &model.key,
            &model.display,
            Arc::new(client),
            Arc::new(provider),
            &symbols,
            &execution,
        );
        match history.load_recent(&ctx.key, WARM_POINTS) {
            Ok(points) => {
                info!(model = %ctx.key, points = points.len(), "balance history loaded");
                ctx.warm_from_history(points);
            }
            Err(e) => warn!(model = %ctx.key, "balance history unavailable: {e}"),
        }
        contexts.push(Arc::new(ctx));
    }

    // ── Probe ────────────────────────────────────────────────────────────
    for ctx in &contexts {
        match ctx.balance(Freshness::Fresh).await {
            Ok(b) => info!(model = %ctx.key, "equity {:.2} {} | available {:.2}", b.total_equity, b.currency, b.available),
            Err(e) => warn!(model = %ctx.key, "balance probe failed: {e}"),
        }
        if execution.dry_run {
            continue;
        }
        for symbol in &symbols {
            match ctx.exchange().set_leverage(&symbol.inst_id, symbol.leverage_default, &execution.margin_mode).await {
                Ok(()) => info!(model = %ctx.key, inst = %symbol.inst_id, "leverage {}x", symbol.leverage_default),
                Err(e) => warn!(model = %ctx.key, inst = %symbol.inst_id, "default leverage not applied: {e}"),
            }
        }
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let engine = ExecutionEngine::new(PositionSizer::new(sizing), execution, ExecutionLock::new());
    let scheduler = Scheduler::new(
        contexts,
        symbols,
        Arc::new(engine),
        Arc::new(NoSentiment),
        history,
        scheduler,
    );
    scheduler.run().await;
    Ok(())
}
