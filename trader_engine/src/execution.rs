/// execution.rs — Position state machine and serialized order execution
///
/// ─────────────────────────────────────────────────────────────────────────
/// STATE MACHINE (one per model × instrument)
/// ─────────────────────────────────────────────────────────────────────────
///
///   state \ signal   BUY            SELL           HOLD
///   Flat             open long      open short     –
///   Long             –              close long     –
///   Short            close short    –              –
///
///   A close never opens the opposite side in the same cycle; the next
///   cycle starts Flat and may open then.
///
/// OPEN PATH (under the process-wide ExecutionLock)
///   1. size from the last known balance; reject if the minimum order
///      does not fit
///   2. keep the provider's quantity if it is within tolerance
///   3. fit margin: halve up to `max_margin_halvings` times, else reject
///   4. pause, read a fresh balance, fit again
///   5. change leverage only if it differs (on failure keep the current one)
///   6. send; margin error → halve and resend, transient error → resend
///      the same size, both with their own budget and backoff
///
/// CLOSE PATH
///   Reduce-only market order for the full position, transient retries only.
/// ─────────────────────────────────────────────────────────────────────────
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::{ExecutionConfig, SymbolConfig};
use crate::context::{Freshness, ModelContext};
use crate::decision::Decision;
use crate::error::{ErrorKind, Result, TraderError};
use crate::exchange::{LotSpec, OrderAck, OrderRequest, OrderSide, Position, PositionSide};
use crate::ledger::Signal;
use crate::sizing::{Confidence, OrderIntent, PositionSizer};

const MARGIN_EPS: f64 = 1e-9;

// ── State machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    Long,
    Short,
}

impl PositionState {
    pub fn of(position: Option<&Position>) -> Self {
        match position {
            Some(p) if p.contracts > 0.0 => match p.side {
                PositionSide::Long  => PositionState::Long,
                PositionSide::Short => PositionState::Short,
            },
            _ => PositionState::Flat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stay,
    Open(OrderSide),
    Close(OrderSide),
}

pub fn transition(state: PositionState, signal: Signal) -> Action {
    match (state, signal) {
        (PositionState::Flat, Signal::Buy)   => Action::Open(OrderSide::Buy),
        (PositionState::Flat, Signal::Sell)  => Action::Open(OrderSide::Sell),
        (PositionState::Long, Signal::Sell)  => Action::Close(OrderSide::Sell),
        (PositionState::Short, Signal::Buy)  => Action::Close(OrderSide::Buy),
        _ => Action::Stay,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    NoAction { state: PositionState },
    SkippedLowConfidence,
    DryRun { side: OrderSide, contracts: f64, leverage: u32, reduce_only: bool },
    Opened { side: OrderSide, intent: OrderIntent, order_id: String, attempts: u32 },
    Closed { side: OrderSide, contracts: f64, order_id: String, attempts: u32 },
    /// Nothing sent: the order could not be made to fit
    Rejected { reason: String },
    /// Sent (or tried to read state) and gave up
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn sent_order(&self) -> bool {
        matches!(self, ExecutionOutcome::Opened { .. } | ExecutionOutcome::Closed { .. })
    }
}

// ── Global lock ──────────────────────────────────────────────────────────

/// Serializes every plan-and-send sequence across all models and
/// instruments. Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLock(Arc<Mutex<()>>);

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

// ── Retry dispatch ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Halve,
    SameSize,
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    margin:    u32,
    transient: u32,
}

impl RetryBudget {
    fn next(&mut self, err: &TraderError) -> Retry {
        match err.kind() {
            ErrorKind::Margin if self.margin > 0 => {
                self.margin -= 1;
                Retry::Halve
            }
            ErrorKind::Transient if self.transient > 0 => {
                self.transient -= 1;
                Retry::SameSize
            }
            _ => Retry::GiveUp,
        }
    }
}

struct Sent {
    ack:      OrderAck,
    intent:   Option<OrderIntent>,
    attempts: u32,
}

// ── Engine ───────────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    sizer: PositionSizer,
    cfg:   ExecutionConfig,
    lock:  ExecutionLock,
}

impl ExecutionEngine {
    pub fn new(sizer: PositionSizer, cfg: ExecutionConfig, lock: ExecutionLock) -> Self {
        Self { sizer, cfg, lock }
    }

    pub fn sizer(&self) -> &PositionSizer {
        &self.sizer
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.cfg
    }

    /// Apply one decision for `symbol`, given the position read this cycle.
    pub async fn execute(
        &self,
        ctx:      &ModelContext,
        symbol:   &SymbolConfig,
        lot:      &LotSpec,
        decision: &Decision,
        price:    f64,
        position: Option<&Position>,
    ) -> ExecutionOutcome {
        let state = PositionState::of(position);
        match (transition(state, decision.signal), position) {
            (Action::Stay, _) => ExecutionOutcome::NoAction { state },
            (Action::Close(side), Some(pos)) => self.close(ctx, symbol, pos, side).await,
            (Action::Close(_), None) => ExecutionOutcome::NoAction { state },
            (Action::Open(side), _) => {
                if self.cfg.skip_low_confidence && decision.confidence == Confidence::Low {
                    info!(model = %ctx.key, inst = %symbol.inst_id, "low confidence, not opening");
                    return ExecutionOutcome::SkippedLowConfidence;
                }
                let current_leverage = ctx.with_symbol(symbol, |s| s.leverage);
                self.open(ctx, symbol, lot, decision, price, side, current_leverage).await
            }
        }
    }

    // ── Open ─────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn open(
        &self,
        ctx:              &ModelContext,
        symbol:           &SymbolConfig,
        lot:              &LotSpec,
        decision:         &Decision,
        price:            f64,
        side:             OrderSide,
        current_leverage: u32,
    ) -> ExecutionOutcome {
        let _guard = self.lock.acquire().await;
        let model = ctx.key.as_str();
        let inst = symbol.inst_id.as_str();

        let balance = match ctx.balance(Freshness::Cached).await {
            Ok(b) => b,
            Err(e) => return failed(model, inst, "balance read", e),
        };
        let reference = match self.sizer.size(&balance, decision.confidence, decision.leverage, price, lot) {
            Ok(i) => i,
            Err(e) => {
                warn!(model, inst, "✘ {e}");
                return ExecutionOutcome::Rejected { reason: e.to_string() };
            }
        };
        let planned = self.sizer.accept_quantity(&reference, decision.order_quantity, lot);
        let usable = self.sizer.usable_margin(&balance);
        let Some(planned) = self.fit_margin(planned, usable, lot) else {
            warn!(model, inst, usable, "✘ order does not fit usable margin");
            return ExecutionOutcome::Rejected { reason: format!("margin does not fit usable {usable:.4}") };
        };

        if self.cfg.settle_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.cfg.settle_delay_ms)).await;
        }
        let fresh = match ctx.balance(Freshness::Fresh).await {
            Ok(b) => b,
            Err(e) => return failed(model, inst, "fresh balance read", e),
        };
        let fresh_usable = self.sizer.usable_margin(&fresh);
        let Some(mut intent) = self.fit_margin(planned, fresh_usable, lot) else {
            warn!(model, inst, usable = fresh_usable, "✘ order no longer fits after fresh balance read");
            return ExecutionOutcome::Rejected {
                reason: format!("margin does not fit fresh usable {fresh_usable:.4}"),
            };
        };

        if self.cfg.dry_run {
            info!(
                model, inst,
                "▶ DRY-RUN open {} {} contracts @ {}x (margin {:.2})",
                side.as_str(), intent.contracts, intent.leverage, intent.margin_required
            );
            return ExecutionOutcome::DryRun {
                side,
                contracts: intent.contracts,
                leverage: intent.leverage,
                reduce_only: false,
            };
        }

        if intent.leverage != current_leverage {
            match ctx.exchange().set_leverage(inst, intent.leverage, &self.cfg.margin_mode).await {
                Ok(()) => {
                    info!(model, inst, "leverage {}x → {}x", current_leverage, intent.leverage);
                    let applied = intent.leverage;
                    ctx.with_symbol(symbol, |s| s.leverage = applied);
                }
                Err(e) => {
                    warn!(model, inst, "leverage change to {}x failed, staying at {}x: {e}", intent.leverage, current_leverage);
                    let Some(kept) = self.fit_margin(intent.at_leverage(lot, current_leverage), fresh_usable, lot) else {
                        return ExecutionOutcome::Rejected {
                            reason: format!("margin does not fit at {current_leverage}x"),
                        };
                    };
                    intent = kept;
                }
            }
        }

        let req = self.order(inst, side, intent.contracts, false);
        info!(model, inst, "▶ OPEN {} {} contracts @ {}x ~{:.2}", side.as_str(), intent.contracts, intent.leverage, price);
        match self.send_with_retry(ctx, req, Some((intent, lot))).await {
            Ok(sent) => {
                let intent = sent.intent.unwrap_or(reference);
                info!(model, inst, "✔ opened order={} attempts={}", sent.ack.order_id, sent.attempts);
                ctx.bump(|c| c.trades_opened += 1);
                ctx.invalidate_balance();
                let opened = Position {
                    inst_id:        inst.to_owned(),
                    side:           if side == OrderSide::Buy { PositionSide::Long } else { PositionSide::Short },
                    contracts:      intent.contracts,
                    entry_price:    price,
                    unrealized_pnl: 0.0,
                    leverage:       intent.leverage,
                    margin:         intent.margin_required,
                };
                ctx.with_symbol(symbol, |s| s.position = Some(opened));
                ExecutionOutcome::Opened { side, intent, order_id: sent.ack.order_id, attempts: sent.attempts }
            }
            Err(e) => failed(model, inst, "open", e),
        }
    }

    /// Halve until the margin fits, at most `max_margin_halvings` times.
    fn fit_margin(&self, mut intent: OrderIntent, usable: f64, lot: &LotSpec) -> Option<OrderIntent> {
        let mut halvings = 0;
        while intent.margin_required > usable + MARGIN_EPS {
            if halvings == self.cfg.max_margin_halvings {
                return None;
            }
            intent = self.sizer.halve(&intent, lot)?;
            halvings += 1;
        }
        Some(intent)
    }

    // ── Close ────────────────────────────────────────────────────────────

    async fn close(&self, ctx: &ModelContext, symbol: &SymbolConfig, pos: &Position, side: OrderSide) -> ExecutionOutcome {
        let _guard = self.lock.acquire().await;
        let model = ctx.key.as_str();
        let inst = symbol.inst_id.as_str();

        if self.cfg.dry_run {
            info!(model, inst, "◀ DRY-RUN close {} {} contracts", side.as_str(), pos.contracts);
            return ExecutionOutcome::DryRun { side, contracts: pos.contracts, leverage: pos.leverage, reduce_only: true };
        }

        let req = self.order(inst, side, pos.contracts, true);
        info!(model, inst, "◀ CLOSE {} {} contracts (entry {:.2})", side.as_str(), pos.contracts, pos.entry_price);
        match self.send_with_retry(ctx, req, None).await {
            Ok(sent) => {
                info!(model, inst, "✔ closed order={} attempts={}", sent.ack.order_id, sent.attempts);
                ctx.bump(|c| c.trades_closed += 1);
                ctx.invalidate_balance();
                ctx.with_symbol(symbol, |s| s.position = None);
                ExecutionOutcome::Closed { side, contracts: pos.contracts, order_id: sent.ack.order_id, attempts: sent.attempts }
            }
            Err(e) => failed(model, inst, "close", e),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    fn order(&self, inst_id: &str, side: OrderSide, contracts: f64, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            inst_id: inst_id.to_owned(),
            side,
            contracts,
            margin_mode: self.cfg.margin_mode.clone(),
            reduce_only,
            tag: self.cfg.order_tag.clone(),
        }
    }

    /// Send `req`, resending per the error kind. Without `sizing` a margin
    /// error is final.
    async fn send_with_retry(
        &self,
        ctx:        &ModelContext,
        mut req:    OrderRequest,
        mut sizing: Option<(OrderIntent, &LotSpec)>,
    ) -> Result<Sent> {
        let mut budget = RetryBudget {
            margin:    if sizing.is_some() { self.cfg.margin_retries } else { 0 },
            transient: self.cfg.transient_retries,
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match ctx.exchange().place_market_order(&req).await {
                Ok(ack) => return Ok(Sent { ack, intent: sizing.map(|(i, _)| i), attempts }),
                Err(e) => e,
            };
            match budget.next(&err) {
                Retry::Halve => {
                    let Some((intent, lot)) = sizing.as_mut() else {
                        return Err(err);
                    };
                    let Some(smaller) = self.sizer.halve(intent, *lot) else {
                        warn!(model = %ctx.key, inst = %req.inst_id, "already at minimum size: {err}");
                        return Err(err);
                    };
                    warn!(
                        model = %ctx.key, inst = %req.inst_id,
                        "margin rejected, halving {} → {} contracts", intent.contracts, smaller.contracts
                    );
                    *intent = smaller;
                    req.contracts = intent.contracts;
                    backoff(self.cfg.margin_backoff_ms).await;
                }
                Retry::SameSize => {
                    warn!(model = %ctx.key, inst = %req.inst_id, attempt = attempts, "transient failure, resending: {err}");
                    backoff(self.cfg.transient_backoff_ms).await;
                }
                Retry::GiveUp => return Err(err),
            }
        }
    }
}

async fn backoff(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn failed(model: &str, inst: &str, what: &str, err: TraderError) -> ExecutionOutcome {
    error!(model, inst, "✘ {what} failed: {err}");
    ExecutionOutcome::Failed { reason: format!("{what}: {err}") }
}
