/// sizing.rs — Margin-bounded position sizing
///
/// USABLE MARGIN
///   usable = min(available, max_total_margin_ratio·equity − used_margin) · safety_buffer
///
/// ORDER SIZE
///   pool      = usable · ratio(confidence)        HIGH 0.7 | MEDIUM 0.5 | LOW 0.3
///   value     = pool · leverage
///   base_qty  = value / price
///   contracts = max(⌈base_qty / ctVal⌉_lotSz, min_contracts)
///   margin    = contracts · ctVal · price / leverage
///
///   If even `min_contracts` needs more margin than `usable`, the cycle is
///   rejected; no order is attempted.
///
/// An externally suggested quantity is only honoured inside
/// [(1−tol)·reference, (1+tol)·reference]; otherwise the reference is used.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::SizingConfig;
use crate::error::{Result, TraderError};
use crate::exchange::{AccountBalance, LotSpec};

const EPS: f64 = 1e-9;

// ── Confidence tiers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub const ALL: [Confidence; 3] = [Confidence::High, Confidence::Medium, Confidence::Low];

    /// Share of usable margin committed at this tier.
    pub fn margin_ratio(self) -> f64 {
        match self {
            Confidence::High   => 0.7,
            Confidence::Medium => 0.5,
            Confidence::Low    => 0.3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High   => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low    => "LOW",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "HIGH"   => Ok(Confidence::High),
            "MEDIUM" => Ok(Confidence::Medium),
            "LOW"    => Ok(Confidence::Low),
            other    => Err(TraderError::DecisionParse(format!("unknown confidence {other:?}"))),
        }
    }
}

// ── Lot arithmetic ───────────────────────────────────────────────────────

fn step_decimals(step: f64) -> i32 {
    format!("{step}")
        .split_once('.')
        .map(|(_, frac)| frac.len() as i32)
        .unwrap_or(0)
        .min(12)
}

fn round_dp(value: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (value * f).round() / f
}

/// Round up to a multiple of `step`, tolerant of float noise (5.2999999 → 5.3).
pub fn ceil_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let units = (value / step - EPS).ceil().max(0.0);
    round_dp(units * step, step_decimals(step))
}

/// Fold a configured minimum base amount into the exchange minimum.
pub fn apply_min_base(lot: &LotSpec, min_base_amount: f64) -> LotSpec {
    let from_base = ceil_to_step(lot.base_to_contracts(min_base_amount), lot.lot_step);
    LotSpec {
        min_contracts: ceil_to_step(lot.min_contracts.max(from_base), lot.lot_step),
        ..lot.clone()
    }
}

pub fn margin_for(contracts: f64, lot: &LotSpec, price: f64, leverage: u32) -> f64 {
    if leverage == 0 {
        return f64::INFINITY;
    }
    lot.contracts_to_base(contracts) * price / leverage as f64
}

// ── Order intent ─────────────────────────────────────────────────────────

/// A sized order, before a side is attached. Resized by retry logic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    pub base_qty:        f64,
    pub contracts:       f64,
    pub leverage:        u32,
    pub price:           f64,
    pub margin_required: f64,
}

impl OrderIntent {
    pub fn new(contracts: f64, lot: &LotSpec, price: f64, leverage: u32) -> Self {
        Self {
            base_qty: lot.contracts_to_base(contracts),
            contracts,
            leverage,
            price,
            margin_required: margin_for(contracts, lot, price, leverage),
        }
    }

    /// Same size at a different leverage.
    pub fn at_leverage(&self, lot: &LotSpec, leverage: u32) -> Self {
        Self::new(self.contracts, lot, self.price, leverage)
    }
}

// ── Position-suggestion table ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub confidence:   Confidence,
    pub leverage:     u32,
    pub contracts:    f64,
    pub base_qty:     f64,
    pub value:        f64,
    pub margin:       f64,
    pub meets_min:    bool,
    pub meets_margin: bool,
}

impl Suggestion {
    pub fn feasible(&self) -> bool {
        self.meets_min && self.meets_margin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionTable {
    pub available:     f64,
    pub usable_margin: f64,
    pub price:         f64,
    pub min_contracts: f64,
    pub min_base:      f64,
    pub contract_size: f64,
    pub rows:          Vec<Suggestion>,
}

impl SuggestionTable {
    pub fn can_trade(&self) -> bool {
        self.rows.iter().any(Suggestion::feasible)
    }

    pub fn get(&self, confidence: Confidence, leverage: u32) -> Option<&Suggestion> {
        self.rows.iter().find(|r| r.confidence == confidence && r.leverage == leverage)
    }

    /// Balance that would make the minimum order feasible at `max_leverage`.
    pub fn required_balance(&self, max_leverage: u32) -> f64 {
        self.min_base * self.price / max_leverage.max(1) as f64
    }
}

// ── Sizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    cfg: SizingConfig,
}

impl PositionSizer {
    pub fn new(cfg: SizingConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.cfg
    }

    pub fn usable_margin(&self, balance: &AccountBalance) -> f64 {
        let headroom = self.cfg.max_total_margin_ratio * balance.total_equity - balance.used_margin;
        (balance.available.min(headroom) * self.cfg.safety_buffer).max(0.0)
    }

    /// Contracts for `confidence` at `leverage`, never below the lot minimum.
    fn target_contracts(&self, usable: f64, confidence: Confidence, leverage: u32, price: f64, lot: &LotSpec) -> f64 {
        if price <= 0.0 {
            return lot.min_contracts;
        }
        let pool = usable * confidence.margin_ratio();
        let base_qty = pool * leverage as f64 / price;
        ceil_to_step(lot.base_to_contracts(base_qty), lot.lot_step).max(lot.min_contracts)
    }

    /// Reference order for one decision.
    pub fn size(
        &self,
        balance:    &AccountBalance,
        confidence: Confidence,
        leverage:   u32,
        price:      f64,
        lot:        &LotSpec,
    ) -> Result<OrderIntent> {
        let usable = self.usable_margin(balance);
        let min_margin = margin_for(lot.min_contracts, lot, price, leverage);
        if min_margin > usable {
            return Err(TraderError::SizingRejected { required: min_margin, usable });
        }
        let contracts = self.target_contracts(usable, confidence, leverage, price, lot);
        Ok(OrderIntent::new(contracts, lot, price, leverage))
    }

    /// Honour an external quantity (base units) only near the reference.
    pub fn accept_quantity(&self, reference: &OrderIntent, suggested_base: Option<f64>, lot: &LotSpec) -> OrderIntent {
        let Some(q) = suggested_base.filter(|q| q.is_finite() && *q > 0.0) else {
            return reference.clone();
        };
        let tol = self.cfg.quantity_tolerance;
        let lo = reference.base_qty * (1.0 - tol);
        let hi = reference.base_qty * (1.0 + tol);
        if reference.base_qty <= 0.0 || q < lo - EPS || q > hi + EPS {
            return reference.clone();
        }
        let contracts = ceil_to_step(lot.base_to_contracts(q), lot.lot_step).max(lot.min_contracts);
        OrderIntent::new(contracts, lot, reference.price, reference.leverage)
    }

    /// Half the size, rounded up to the lot step and floored at the minimum.
    /// `None` once the order is already at the minimum.
    pub fn halve(&self, intent: &OrderIntent, lot: &LotSpec) -> Option<OrderIntent> {
        let contracts = ceil_to_step(intent.contracts * 0.5, lot.lot_step).max(lot.min_contracts);
        if contracts + EPS >= intent.contracts {
            return None;
        }
        Some(OrderIntent::new(contracts, lot, intent.price, intent.leverage))
    }

    /// Every confidence tier × the instrument's leverage choices.
    pub fn suggestions(&self, balance: &AccountBalance, price: f64, lot: &LotSpec, leverages: &[u32]) -> SuggestionTable {
        let usable = self.usable_margin(balance);
        let mut rows = Vec::with_capacity(Confidence::ALL.len() * leverages.len());
        for confidence in Confidence::ALL {
            for &leverage in leverages {
                let contracts = self.target_contracts(usable, confidence, leverage, price, lot);
                let base_qty = lot.contracts_to_base(contracts);
                let margin = margin_for(contracts, lot, price, leverage);
                rows.push(Suggestion {
                    confidence,
                    leverage,
                    contracts,
                    base_qty,
                    value: base_qty * price,
                    margin,
                    meets_min: contracts + EPS >= lot.min_contracts,
                    meets_margin: margin <= usable + EPS,
                });
            }
        }
        SuggestionTable {
            available: balance.available,
            usable_margin: usable,
            price,
            min_contracts: lot.min_contracts,
            min_base: lot.contracts_to_base(lot.min_contracts),
            contract_size: lot.contract_size,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_lot() -> LotSpec {
        LotSpec { inst_id: "BTC-USDT-SWAP".into(), contract_size: 0.01, lot_step: 0.1, min_contracts: 1.0 }
    }

    fn flat_account(equity: f64) -> AccountBalance {
        AccountBalance { total_equity: equity, available: equity, currency: "USDT".into(), ..Default::default() }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingConfig::default())
    }

    #[test]
    fn usable_margin_is_capped_by_equity_share() {
        assert!((sizer().usable_margin(&flat_account(1000.0)) - 375.0).abs() < 1e-9);

        let busy = AccountBalance { total_equity: 1000.0, available: 600.0, used_margin: 400.0, ..Default::default() };
        // min(600, 500 - 400) * 0.75
        assert!((sizer().usable_margin(&busy) - 75.0).abs() < 1e-9);

        let over = AccountBalance { total_equity: 1000.0, available: 100.0, used_margin: 700.0, ..Default::default() };
        assert_eq!(sizer().usable_margin(&over), 0.0);
    }

    #[test]
    fn reference_order_rounds_up_to_the_lot_step() {
        let intent = sizer()
            .size(&flat_account(1000.0), Confidence::High, 10, 50_000.0, &btc_lot())
            .unwrap();
        assert!((intent.contracts - 5.3).abs() < 1e-9, "contracts = {}", intent.contracts);
        assert!((intent.base_qty - 0.053).abs() < 1e-9);
        assert!((intent.margin_required - 265.0).abs() < 1e-6, "margin = {}", intent.margin_required);
    }

    #[test]
    fn rejected_when_minimum_needs_too_much_margin() {
        let err = sizer()
            .size(&flat_account(1000.0), Confidence::High, 10, 2_000_000.0, &btc_lot())
            .unwrap_err();
        match err {
            TraderError::SizingRejected { required, usable } => {
                assert!((required - 2000.0).abs() < 1e-6);
                assert!((usable - 375.0).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn small_target_is_lifted_to_the_minimum() {
        // 375 * 0.3 * 3 / 50000 = 0.00675 BTC = 0.675 contracts → minimum 1
        let intent = sizer()
            .size(&flat_account(1000.0), Confidence::Low, 3, 50_000.0, &btc_lot())
            .unwrap();
        assert_eq!(intent.contracts, 1.0);
    }

    #[test]
    fn suggested_quantity_inside_tolerance_is_kept() {
        let lot = btc_lot();
        let reference = sizer().size(&flat_account(1000.0), Confidence::High, 10, 50_000.0, &lot).unwrap();
        let kept = sizer().accept_quantity(&reference, Some(0.05), &lot);
        assert!((kept.contracts - 5.0).abs() < 1e-9);
        assert!((kept.margin_required - 250.0).abs() < 1e-6);
    }

    #[test]
    fn suggested_quantity_outside_tolerance_is_replaced() {
        let lot = btc_lot();
        let reference = sizer().size(&flat_account(1000.0), Confidence::High, 10, 50_000.0, &lot).unwrap();
        assert_eq!(sizer().accept_quantity(&reference, Some(0.1), &lot), reference);
        assert_eq!(sizer().accept_quantity(&reference, Some(0.01), &lot), reference);
        assert_eq!(sizer().accept_quantity(&reference, None, &lot), reference);
        assert_eq!(sizer().accept_quantity(&reference, Some(f64::NAN), &lot), reference);
    }

    #[test]
    fn halving_stops_at_the_minimum() {
        let lot = btc_lot();
        let intent = OrderIntent::new(5.3, &lot, 50_000.0, 10);
        let h1 = sizer().halve(&intent, &lot).unwrap();
        assert!((h1.contracts - 2.7).abs() < 1e-9);
        let h2 = sizer().halve(&h1, &lot).unwrap();
        assert!((h2.contracts - 1.4).abs() < 1e-9);
        let h3 = sizer().halve(&h2, &lot).unwrap();
        assert_eq!(h3.contracts, 1.0);
        assert!(sizer().halve(&h3, &lot).is_none());
    }

    #[test]
    fn ceil_to_step_tolerates_float_noise() {
        assert_eq!(ceil_to_step(5.25, 0.1), 5.3);
        assert_eq!(ceil_to_step(5.3000000000001, 0.1), 5.3);
        assert_eq!(ceil_to_step(0.675, 1.0), 1.0);
        assert_eq!(ceil_to_step(12.0, 0.01), 12.0);
    }

    #[test]
    fn configured_minimum_base_raises_min_contracts() {
        let lot = LotSpec { inst_id: "DOGE-USDT-SWAP".into(), contract_size: 1000.0, lot_step: 0.01, min_contracts: 0.01 };
        assert_eq!(apply_min_base(&lot, 10.0).min_contracts, 0.01);
        assert_eq!(apply_min_base(&lot, 25.0).min_contracts, 0.03);
    }

    #[test]
    fn suggestion_table_flags_infeasible_rows() {
        let lot = btc_lot();
        // usable = 15 * 0.75 = 11.25; minimum 1 contract at 3x needs 166.7
        let table = sizer().suggestions(&flat_account(30.0), 50_000.0, &lot, &[3, 10, 20]);
        assert_eq!(table.rows.len(), 9);
        assert!(!table.can_trade());
        assert!(!table.get(Confidence::High, 3).unwrap().meets_margin);

        let rich = sizer().suggestions(&flat_account(1000.0), 50_000.0, &lot, &[3, 10, 20]);
        assert!(rich.can_trade());
        assert!(rich.get(Confidence::High, 10).unwrap().feasible());
    }

    #[test]
    fn confidence_parsing() {
        assert_eq!("high".parse::<Confidence>().unwrap(), Confidence::High);
        assert_eq!(" Medium ".parse::<Confidence>().unwrap(), Confidence::Medium);
        assert!("sure".parse::<Confidence>().is_err());
    }
}
