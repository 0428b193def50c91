/// testkit.rs — In-process doubles for the exchange and provider seams
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::decision::DecisionProvider;
use crate::error::{Result, TraderError};
use crate::exchange::{AccountBalance, Candle, Exchange, LotSpec, OrderAck, OrderRequest, Position};

pub fn btc_lot() -> LotSpec {
    LotSpec { inst_id: "BTC-USDT-SWAP".into(), contract_size: 0.01, lot_step: 0.1, min_contracts: 1.0 }
}

pub fn account(equity: f64) -> AccountBalance {
    AccountBalance { total_equity: equity, available: equity, currency: "USDT".into(), ..Default::default() }
}

/// Gently rising closes around `base`.
pub fn candles(base: f64, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let c = base + i as f64;
            Candle { ts: i as i64 * 300_000, open: c - 0.5, high: c + 1.0, low: c - 1.0, close: c, volume: 10.0 }
        })
        .collect()
}

#[derive(Default)]
struct MockState {
    /// Served front to back; the last one repeats
    balances:         VecDeque<AccountBalance>,
    position:         Option<Position>,
    lot:              Option<LotSpec>,
    candles:          Vec<Candle>,
    /// Queued failures for successive orders; empty means accept
    order_errors:     VecDeque<TraderError>,
    orders:           Vec<OrderRequest>,
    leverage_calls:   Vec<u32>,
    leverage_fails:   bool,
    balance_calls:    usize,
    instrument_calls: usize,
    in_flight:        usize,
    max_in_flight:    usize,
}

pub struct MockExchange {
    inner:       Mutex<MockState>,
    order_delay: Duration,
}

impl MockExchange {
    pub fn with_equity(equity: f64) -> Self {
        let state = MockState {
            balances: VecDeque::from([account(equity)]),
            lot:      Some(btc_lot()),
            candles:  candles(50_000.0, 60),
            ..Default::default()
        };
        Self { inner: Mutex::new(state), order_delay: Duration::ZERO }
    }

    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self
    }

    pub fn push_balance(&self, bal: AccountBalance) {
        self.inner.lock().balances.push_back(bal);
    }

    pub fn set_position(&self, pos: Option<Position>) {
        self.inner.lock().position = pos;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.inner.lock().candles = candles;
    }

    pub fn fail_orders(&self, errors: impl IntoIterator<Item = TraderError>) {
        self.inner.lock().order_errors.extend(errors);
    }

    pub fn fail_leverage(&self) {
        self.inner.lock().leverage_fails = true;
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.inner.lock().orders.clone()
    }

    pub fn leverage_calls(&self) -> Vec<u32> {
        self.inner.lock().leverage_calls.clone()
    }

    pub fn balance_calls(&self) -> usize {
        self.inner.lock().balance_calls
    }

    pub fn instrument_calls(&self) -> usize {
        self.inner.lock().instrument_calls
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().max_in_flight
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn fetch_candles(&self, _inst_id: &str, _bar: &str, limit: usize) -> Result<Vec<Candle>> {
        let s = self.inner.lock();
        Ok(s.candles[s.candles.len().saturating_sub(limit)..].to_vec())
    }

    async fn fetch_instrument(&self, inst_id: &str) -> Result<LotSpec> {
        let mut s = self.inner.lock();
        s.instrument_calls += 1;
        s.lot
            .clone()
            .map(|l| LotSpec { inst_id: inst_id.to_owned(), ..l })
            .ok_or_else(|| TraderError::Protocol { code: "51001".into(), msg: "instrument not found".into() })
    }

    async fn fetch_balance(&self, _ccy: &str) -> Result<AccountBalance> {
        let mut s = self.inner.lock();
        s.balance_calls += 1;
        if s.balances.len() > 1 {
            return Ok(s.balances.pop_front().unwrap_or_default());
        }
        Ok(s.balances.front().cloned().unwrap_or_default())
    }

    async fn fetch_position(&self, _inst_id: &str, _default_leverage: u32) -> Result<Option<Position>> {
        Ok(self.inner.lock().position.clone())
    }

    async fn set_leverage(&self, _inst_id: &str, leverage: u32, _margin_mode: &str) -> Result<()> {
        let mut s = self.inner.lock();
        s.leverage_calls.push(leverage);
        if s.leverage_fails {
            return Err(TraderError::Protocol { code: "59000".into(), msg: "leverage change refused".into() });
        }
        Ok(())
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        {
            let mut s = self.inner.lock();
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
        }
        if !self.order_delay.is_zero() {
            tokio::time::sleep(self.order_delay).await;
        }
        let mut s = self.inner.lock();
        s.in_flight -= 1;
        s.orders.push(order.clone());
        match s.order_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(OrderAck { order_id: format!("ord-{}", s.orders.len()), client_order_id: None }),
        }
    }
}

/// Provider that returns a fixed answer, or fails when built with `failing`.
pub struct StaticProvider {
    answer:  Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl StaticProvider {
    pub fn new(answer: &str) -> Self {
        Self { answer: Some(answer.to_owned()), prompts: Mutex::new(Vec::new()) }
    }

    pub fn failing() -> Self {
        Self { answer: None, prompts: Mutex::new(Vec::new()) }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl DecisionProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_owned());
        self.answer
            .clone()
            .ok_or_else(|| TraderError::Network("provider unreachable".into()))
    }
}
