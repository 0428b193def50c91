/// scheduler.rs — Wall-clock aligned cycle driver
///
/// TIMING
///   Cycles start on multiples of the interval since the Unix epoch
///   (:00, :05, :10 … for 5 minutes). A boundary closer than `min_lead_secs`
///   is skipped so a late start never runs two cycles back to back.
///
/// FAN-OUT
///   models       → sequential
///   instruments  → concurrent (JoinSet), start staggered by `stagger_secs`
///   each task    → its own timeout; failure, timeout or panic is logged and
///                  never touches sibling tasks
///
/// After each model's instruments finish, a fresh balance is read and
/// written to the history store at the cycle timestamp. After all models,
/// yesterday is archived once.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{SchedulerConfig, SymbolConfig};
use crate::context::{Freshness, ModelContext};
use crate::cycle::{run_symbol_cycle, CycleReport};
use crate::decision::SentimentFeed;
use crate::error::{Result, TraderError};
use crate::execution::ExecutionEngine;
use crate::history::{BalanceHistoryStore, BalanceSnapshot, CompactOutcome};

/// First interval boundary after `now` that is at least `min_lead` away.
pub fn next_boundary(now: DateTime<Utc>, interval_minutes: u32, min_lead: Duration) -> DateTime<Utc> {
    let step = i64::from(interval_minutes.max(1)) * 60_000;
    let now_ms = now.timestamp_millis();
    let mut next = (now_ms.div_euclid(step) + 1) * step;
    if next - now_ms < min_lead.as_millis() as i64 {
        next += step;
    }
    DateTime::<Utc>::from_timestamp_millis(next).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCycleSummary {
    pub completed: usize,
    pub failed:    usize,
    pub timed_out: usize,
}

pub struct Scheduler {
    models:    Vec<Arc<ModelContext>>,
    symbols:   Vec<SymbolConfig>,
    engine:    Arc<ExecutionEngine>,
    sentiment: Arc<dyn SentimentFeed>,
    history:   BalanceHistoryStore,
    cfg:       SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        models:    Vec<Arc<ModelContext>>,
        symbols:   Vec<SymbolConfig>,
        engine:    Arc<ExecutionEngine>,
        sentiment: Arc<dyn SentimentFeed>,
        history:   BalanceHistoryStore,
        cfg:       SchedulerConfig,
    ) -> Self {
        Self { models, symbols, engine, sentiment, history, cfg }
    }

    pub fn models(&self) -> &[Arc<ModelContext>] {
        &self.models
    }

    /// Run forever.
    pub async fn run(&self) {
        info!(
            models = self.models.len(),
            symbols = self.symbols.len(),
            "scheduler started, every {} min",
            self.cfg.interval_minutes
        );
        loop {
            let next = next_boundary(
                Utc::now(),
                self.cfg.interval_minutes,
                Duration::from_secs(self.cfg.min_lead_secs),
            );
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!("next cycle at {} (in {}s)", next.format("%H:%M:%S"), wait.as_secs());
            tokio::time::sleep(wait).await;

            if let Err(e) = self.run_cycle(next).await {
                error!("cycle at {next} failed: {e}; backing off {}s", self.cfg.error_backoff_secs);
                tokio::time::sleep(Duration::from_secs(self.cfg.error_backoff_secs)).await;
            }
        }
    }

    /// One full cycle over every model.
    pub async fn run_cycle(&self, ts: DateTime<Utc>) -> Result<()> {
        for ctx in &self.models {
            let summary = self.run_model(ctx, ts).await;
            info!(
                model = %ctx.key,
                completed = summary.completed,
                failed = summary.failed,
                timed_out = summary.timed_out,
                "model cycle done"
            );
            if let Err(e) = self.record_balance(ctx, ts).await {
                warn!(model = %ctx.key, "balance snapshot failed: {e}");
            }
        }

        let store = self.history.clone();
        let compacted = tokio::task::spawn_blocking(move || store.compact_if_needed(ts))
            .await
            .map_err(|e| TraderError::Storage(format!("compaction task: {e}")))??;
        if let Some(CompactOutcome::Archived { path, rows }) = compacted {
            info!(rows, "archived balance history to {}", path.display());
        }
        Ok(())
    }

    /// All instruments of one model, concurrently.
    pub async fn run_model(&self, ctx: &Arc<ModelContext>, ts: DateTime<Utc>) -> ModelCycleSummary {
        let mut tasks = JoinSet::new();
        let timeout = Duration::from_secs(self.cfg.task_timeout_secs);

        for (i, symbol) in self.symbols.iter().enumerate() {
            let ctx = Arc::clone(ctx);
            let engine = Arc::clone(&self.engine);
            let sentiment = Arc::clone(&self.sentiment);
            let symbol = symbol.clone();
            let delay = Duration::from_secs(self.cfg.stagger_secs * i as u64);

            tasks.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let run = run_symbol_cycle(&ctx, &engine, sentiment.as_ref(), &symbol, ts);
                let result = tokio::time::timeout(timeout, run).await;
                (symbol.inst_id, result)
            });
        }

        let mut summary = ModelCycleSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((inst, Ok(Ok(report)))) => {
                    summary.completed += 1;
                    log_report(&ctx.key, &inst, &report);
                }
                Ok((inst, Ok(Err(e)))) => {
                    summary.failed += 1;
                    error!(model = %ctx.key, inst = %inst, "cycle failed: {e}");
                }
                Ok((inst, Err(_))) => {
                    summary.timed_out += 1;
                    error!(model = %ctx.key, inst = %inst, "cycle timed out after {}s", timeout.as_secs());
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(model = %ctx.key, "cycle task aborted: {e}");
                }
            }
        }
        summary
    }

    async fn record_balance(&self, ctx: &ModelContext, ts: DateTime<Utc>) -> Result<()> {
        let bal = ctx.balance(Freshness::Fresh).await?;
        let snap = BalanceSnapshot {
            model:          ctx.key.clone(),
            timestamp:      ts,
            total_equity:   bal.total_equity,
            available:      bal.available,
            unrealized_pnl: bal.unrealized_pnl,
            currency:       bal.currency,
        };
        ctx.with_state(|s| s.push_balance_point(snap.clone()));
        let store = self.history.clone();
        tokio::task::spawn_blocking(move || store.append(&snap))
            .await
            .map_err(|e| TraderError::Storage(format!("history write task: {e}")))?
    }
}

fn log_report(model: &str, inst: &str, report: &CycleReport) {
    info!(
        model, inst,
        price = report.price,
        "{} {} → {:?}",
        report.decision.signal, report.decision.confidence, report.outcome
    );
}
