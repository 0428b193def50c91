/// context.rs — Per-model state, passed explicitly
///
/// One `ModelContext` per enabled model. It owns that model's exchange
/// client and decision provider plus every piece of mutable state the
/// model's workers touch: per-instrument ledgers, cached positions and
/// leverage, decision log, counters, account summary.
///
/// LOCKING
///   `state` is a parking_lot mutex, only ever taken inside the short
///   closures passed to `with_state` / `with_symbol`; it is never held
///   across an await. Readers wanting a consistent view call `snapshot()`,
///   which deep-clones under the lock.
///
///   The balance cache has its own lock. `balance(Freshness::Cached)`
///   serves a reading younger than the TTL; `balance(Freshness::Fresh)`
///   always goes to the exchange.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::{ExecutionConfig, SymbolConfig};
use crate::decision::{Decision, DecisionProvider};
use crate::error::Result;
use crate::exchange::{AccountBalance, Exchange, LotSpec, Position};
use crate::history::BalanceSnapshot;
use crate::ledger::{Accuracy, SignalLedger, SignalRecord};
use crate::prompt::RuntimeStats;

pub const DECISION_LOG_CAP: usize = 50;
pub const BALANCE_POINTS_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Cached,
    Fresh,
}

// ── State ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Counters {
    pub ai_calls:          u64,
    pub ai_errors:         u64,
    pub signals_generated: u64,
    pub trades_opened:     u64,
    pub trades_closed:     u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountSummary {
    pub total_equity:   f64,
    pub available:      f64,
    pub used_margin:    f64,
    pub unrealized_pnl: f64,
    pub updated_at:     Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionEntry {
    pub timestamp: DateTime<Utc>,
    pub price:     f64,
    pub decision:  Decision,
}

#[derive(Debug, Clone)]
pub struct SymbolState {
    pub ledger:    SignalLedger,
    pub position:  Option<Position>,
    /// Leverage last applied on the exchange (instrument default until then)
    pub leverage:  u32,
    pub lot:       Option<LotSpec>,
    pub last_price: f64,
    pub decisions: VecDeque<DecisionEntry>,
}

impl SymbolState {
    fn new(symbol: &SymbolConfig) -> Self {
        Self {
            ledger:     SignalLedger::new(),
            position:   None,
            leverage:   symbol.leverage_default,
            lot:        None,
            last_price: 0.0,
            decisions:  VecDeque::with_capacity(DECISION_LOG_CAP),
        }
    }

    pub fn log_decision(&mut self, entry: DecisionEntry) {
        if self.decisions.len() == DECISION_LOG_CAP {
            self.decisions.pop_front();
        }
        self.decisions.push_back(entry);
    }
}

#[derive(Debug, Default)]
pub struct ModelState {
    pub symbols:         AHashMap<String, SymbolState>,
    pub counters:        Counters,
    pub account:         AccountSummary,
    pub balance_history: VecDeque<BalanceSnapshot>,
}

impl ModelState {
    pub fn push_balance_point(&mut self, snap: BalanceSnapshot) {
        if self.balance_history.len() == BALANCE_POINTS_CAP {
            self.balance_history.pop_front();
        }
        self.balance_history.push_back(snap);
    }
}

// ── Snapshot (for external viewers) ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolSnapshot {
    pub inst_id:   String,
    pub price:     f64,
    pub leverage:  u32,
    pub position:  Option<Position>,
    pub decisions: Vec<DecisionEntry>,
    pub signals:   Vec<SignalRecord>,
    pub accuracy:  Accuracy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSnapshot {
    pub key:             String,
    pub display:         String,
    pub started_at:      DateTime<Utc>,
    pub account:         AccountSummary,
    pub counters:        Counters,
    pub symbols:         Vec<SymbolSnapshot>,
    pub balance_history: Vec<BalanceSnapshot>,
}

// ── Context ──────────────────────────────────────────────────────────────

pub struct ModelContext {
    pub key:        String,
    pub display:    String,
    pub started_at: DateTime<Utc>,
    exchange:       Arc<dyn Exchange>,
    provider:       Arc<dyn DecisionProvider>,
    state:          Mutex<ModelState>,
    balance_cache:  Mutex<Option<(Instant, AccountBalance)>>,
    balance_ttl:    Duration,
    quote_ccy:      String,
}

impl ModelContext {
    pub fn new(
        key:      &str,
        display:  &str,
        exchange: Arc<dyn Exchange>,
        provider: Arc<dyn DecisionProvider>,
        symbols:  &[SymbolConfig],
        exec:     &ExecutionConfig,
    ) -> Self {
        let state = ModelState {
            symbols: symbols.iter().map(|s| (s.inst_id.clone(), SymbolState::new(s))).collect(),
            ..Default::default()
        };
        Self {
            key:           key.to_owned(),
            display:       display.to_owned(),
            started_at:    Utc::now(),
            exchange,
            provider,
            state:         Mutex::new(state),
            balance_cache: Mutex::new(None),
            balance_ttl:   Duration::from_millis(exec.balance_cache_ttl_ms),
            quote_ccy:     exec.quote_currency.clone(),
        }
    }

    pub fn exchange(&self) -> &dyn Exchange {
        self.exchange.as_ref()
    }

    pub fn provider(&self) -> &dyn DecisionProvider {
        self.provider.as_ref()
    }

    pub fn quote_currency(&self) -> &str {
        &self.quote_ccy
    }

    /// Run `f` with the state lock held. Never await inside.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ModelState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Run `f` against one instrument's state, creating it on first use.
    pub fn with_symbol<R>(&self, symbol: &SymbolConfig, f: impl FnOnce(&mut SymbolState) -> R) -> R {
        let mut state = self.state.lock();
        let entry = state
            .symbols
            .entry(symbol.inst_id.clone())
            .or_insert_with(|| SymbolState::new(symbol));
        f(entry)
    }

    pub fn bump(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.state.lock().counters);
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    pub fn runtime_stats(&self, now: DateTime<Utc>) -> RuntimeStats {
        let state = self.state.lock();
        RuntimeStats {
            uptime_minutes: (now - self.started_at).num_minutes(),
            ai_calls:       state.counters.ai_calls,
            trades_opened:  state.counters.trades_opened,
            trades_closed:  state.counters.trades_closed,
            open_positions: state.symbols.values().filter(|s| s.position.is_some()).count(),
        }
    }

    // ── Exchange reads with local caching ────────────────────────────────

    pub async fn balance(&self, freshness: Freshness) -> Result<AccountBalance> {
        if freshness == Freshness::Cached {
            let cached = self
                .balance_cache
                .lock()
                .as_ref()
                .filter(|(at, _)| at.elapsed() < self.balance_ttl)
                .map(|(_, bal)| bal.clone());
            if let Some(bal) = cached {
                return Ok(bal);
            }
        }
        let bal = self.exchange.fetch_balance(&self.quote_ccy).await?;
        *self.balance_cache.lock() = Some((Instant::now(), bal.clone()));
        self.with_state(|s| {
            s.account = AccountSummary {
                total_equity:   bal.total_equity,
                available:      bal.available,
                used_margin:    bal.used_margin,
                unrealized_pnl: bal.unrealized_pnl,
                updated_at:     Some(Utc::now()),
            };
        });
        debug!(model = %self.key, equity = bal.total_equity, available = bal.available, ?freshness, "balance read");
        Ok(bal)
    }

    /// Drop the cached balance (after an order changed it).
    pub fn invalidate_balance(&self) {
        *self.balance_cache.lock() = None;
    }

    /// Instrument lot constraints, fetched once per instrument.
    pub async fn lot_spec(&self, symbol: &SymbolConfig) -> Result<LotSpec> {
        if let Some(lot) = self.with_symbol(symbol, |s| s.lot.clone()) {
            return Ok(lot);
        }
        let lot = self.exchange.fetch_instrument(&symbol.inst_id).await?;
        self.with_symbol(symbol, |s| s.lot = Some(lot.clone()));
        Ok(lot)
    }

    /// Current position from the exchange; refreshes the local cache.
    pub async fn position(&self, symbol: &SymbolConfig) -> Result<Option<Position>> {
        let pos = self
            .exchange
            .fetch_position(&symbol.inst_id, symbol.leverage_default)
            .await?;
        self.with_symbol(symbol, |s| {
            if let Some(p) = &pos {
                s.leverage = p.leverage;
            }
            s.position = pos.clone();
        });
        Ok(pos)
    }

    /// Seed the account summary and balance curve from stored history.
    pub fn warm_from_history(&self, points: Vec<BalanceSnapshot>) {
        self.with_state(|s| {
            if let Some(last) = points.last() {
                s.account = AccountSummary {
                    total_equity:   last.total_equity,
                    available:      last.available,
                    used_margin:    0.0,
                    unrealized_pnl: last.unrealized_pnl,
                    updated_at:     Some(last.timestamp),
                };
            }
            for p in points {
                s.push_balance_point(p);
            }
        });
    }

    /// Deep copy of everything an external viewer may show.
    pub fn snapshot(&self) -> ModelSnapshot {
        let state = self.state.lock();
        let mut symbols: Vec<SymbolSnapshot> = state
            .symbols
            .iter()
            .map(|(inst_id, s)| SymbolSnapshot {
                inst_id:   inst_id.clone(),
                price:     s.last_price,
                leverage:  s.leverage,
                position:  s.position.clone(),
                decisions: s.decisions.iter().cloned().collect(),
                signals:   s.ledger.records().cloned().collect(),
                accuracy:  s.ledger.accuracy(50),
            })
            .collect();
        symbols.sort_by(|a, b| a.inst_id.cmp(&b.inst_id));
        ModelSnapshot {
            key:             self.key.clone(),
            display:         self.display.clone(),
            started_at:      self.started_at,
            account:         state.account.clone(),
            counters:        state.counters,
            symbols,
            balance_history: state.balance_history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Signal;
    use crate::sizing::Confidence;
    use crate::testkit::{MockExchange, StaticProvider};

    fn ctx(ex: Arc<MockExchange>) -> ModelContext {
        let exec = ExecutionConfig { balance_cache_ttl_ms: 60_000, ..Default::default() };
        ModelContext::new(
            "deepseek",
            "DeepSeek",
            ex,
            Arc::new(StaticProvider::new("{}")),
            &[SymbolConfig::builtin("BTC-USDT-SWAP").unwrap()],
            &exec,
        )
    }

    #[tokio::test]
    async fn cached_balance_is_reused_until_fresh_is_requested() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let c = ctx(ex.clone());
        c.balance(Freshness::Cached).await.unwrap();
        c.balance(Freshness::Cached).await.unwrap();
        assert_eq!(ex.balance_calls(), 1);
        c.balance(Freshness::Fresh).await.unwrap();
        assert_eq!(ex.balance_calls(), 2);
        assert_eq!(c.snapshot().account.total_equity, 1000.0);
    }

    #[tokio::test]
    async fn lot_spec_is_fetched_once() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let c = ctx(ex.clone());
        let btc = SymbolConfig::builtin("BTC-USDT-SWAP").unwrap();
        c.lot_spec(&btc).await.unwrap();
        c.lot_spec(&btc).await.unwrap();
        assert_eq!(ex.instrument_calls(), 1);
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let c = ctx(ex);
        let btc = SymbolConfig::builtin("BTC-USDT-SWAP").unwrap();
        c.with_symbol(&btc, |s| {
            s.ledger.record(Signal::Buy, Confidence::High, 10, 100.0, Utc::now());
        });
        let snap = c.snapshot();
        c.with_symbol(&btc, |s| {
            s.ledger.validate(101.0, Utc::now());
            s.ledger.record(Signal::Sell, Confidence::Low, 5, 101.0, Utc::now());
        });
        let signals = &snap.symbols[0].signals;
        assert_eq!(signals.len(), 1);
        assert!(signals[0].validation_price.is_none());
    }

    #[test]
    fn decision_log_is_bounded() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let c = ctx(ex);
        let btc = SymbolConfig::builtin("BTC-USDT-SWAP").unwrap();
        for i in 0..(DECISION_LOG_CAP + 3) {
            let d = crate::decision::fallback_hold(&btc, 100.0 + i as f64, "test");
            c.with_symbol(&btc, |s| s.log_decision(DecisionEntry { timestamp: Utc::now(), price: 100.0, decision: d }));
        }
        let snap = c.snapshot();
        assert_eq!(snap.symbols[0].decisions.len(), DECISION_LOG_CAP);
        assert!((snap.symbols[0].decisions[0].decision.stop_loss - 103.0 * 0.98).abs() < 1e-9);
    }
}
