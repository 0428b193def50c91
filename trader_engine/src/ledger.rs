/// ledger.rs — Per-instrument signal history and accuracy
///
/// ─────────────────────────────────────────────────────────────────────────
/// VALIDATION RULE
/// ─────────────────────────────────────────────────────────────────────────
///
///   pct = (price_now − entry) / entry × 100
///
///   BUY  → success iff pct ≥ 0
///   SELL → success iff pct ≤ 0
///   HOLD → success iff |pct| ≤ 0.5
///
///   A record is validated exactly once, on the first cycle after it was
///   written; its outcome never changes afterwards.
///
/// ACCURACY
///   Over the most recent N validated records: total, successes, ratio,
///   plus the same tally per signal, per confidence tier and per leverage
///   bucket (3–8x, 9–12x, 13–20x).
/// ─────────────────────────────────────────────────────────────────────────
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TraderError};
use crate::sizing::Confidence;

pub const LEDGER_CAPACITY: usize = 200;
/// Largest move (in percent) a HOLD may see and still count as correct
pub const HOLD_TOLERANCE_PCT: f64 = 0.5;
pub const ACCURACY_WINDOWS: [usize; 3] = [10, 30, 50];

// ── Signal ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Buy, Signal::Sell, Signal::Hold];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Buy  => "BUY",
            Signal::Sell => "SELL",
            Signal::Hold => "HOLD",
        }
    }

    /// Was the call right, given the move since entry (percent)?
    pub fn judge(self, change_pct: f64) -> bool {
        match self {
            Signal::Buy  => change_pct >= 0.0,
            Signal::Sell => change_pct <= 0.0,
            Signal::Hold => change_pct.abs() <= HOLD_TOLERANCE_PCT,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY"  => Ok(Signal::Buy),
            "SELL" => Ok(Signal::Sell),
            "HOLD" => Ok(Signal::Hold),
            other  => Err(TraderError::DecisionParse(format!("unknown signal {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalOutcome {
    #[default]
    Unknown,
    Success,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeverageBucket {
    #[serde(rename = "3-8x")]
    Low,
    #[serde(rename = "9-12x")]
    Mid,
    #[serde(rename = "13-20x")]
    High,
}

impl LeverageBucket {
    pub const ALL: [LeverageBucket; 3] = [LeverageBucket::Low, LeverageBucket::Mid, LeverageBucket::High];

    pub fn of(leverage: u32) -> Option<Self> {
        match leverage {
            3..=8   => Some(LeverageBucket::Low),
            9..=12  => Some(LeverageBucket::Mid),
            13..=20 => Some(LeverageBucket::High),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LeverageBucket::Low  => "3-8x",
            LeverageBucket::Mid  => "9-12x",
            LeverageBucket::High => "13-20x",
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub timestamp:        DateTime<Utc>,
    pub signal:           Signal,
    pub confidence:       Confidence,
    pub leverage:         u32,
    pub entry_price:      f64,
    pub reason:           String,
    pub stop_loss:        Option<f64>,
    pub take_profit:      Option<f64>,
    pub validation_price: Option<f64>,
    pub validated_at:     Option<DateTime<Utc>>,
    pub change_pct:       Option<f64>,
    pub outcome:          SignalOutcome,
}

impl SignalRecord {
    pub fn is_validated(&self) -> bool {
        self.validation_price.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Tally {
    pub total:   usize,
    pub success: usize,
}

impl Tally {
    fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.success as f64 / self.total as f64)
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ratio() {
            Some(r) => write!(f, "{:.0}% ({}✓/{})", r * 100.0, self.success, self.total),
            None => f.write_str("-- (--/0)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accuracy {
    pub window:        usize,
    pub overall:       Tally,
    pub by_signal:     Vec<(Signal, Tally)>,
    pub by_confidence: Vec<(Confidence, Tally)>,
    pub by_leverage:   Vec<(LeverageBucket, Tally)>,
}

// ── Ledger ───────────────────────────────────────────────────────────────

/// Bounded history for one instrument; the oldest record is dropped once
/// the ledger holds `LEDGER_CAPACITY` entries.
#[derive(Debug, Clone, Default)]
pub struct SignalLedger {
    records: VecDeque<SignalRecord>,
}

impl SignalLedger {
    pub fn new() -> Self {
        Self { records: VecDeque::with_capacity(LEDGER_CAPACITY) }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl DoubleEndedIterator<Item = &SignalRecord> + ExactSizeIterator {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&SignalRecord> {
        self.records.back()
    }

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<SignalRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Append a decision; returns the stored record so the caller can attach
    /// reason and protective levels.
    pub fn record(
        &mut self,
        signal:      Signal,
        confidence:  Confidence,
        leverage:    u32,
        entry_price: f64,
        timestamp:   DateTime<Utc>,
    ) -> &mut SignalRecord {
        if self.records.len() == LEDGER_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(SignalRecord {
            timestamp,
            signal,
            confidence,
            leverage,
            entry_price,
            reason:           String::new(),
            stop_loss:        None,
            take_profit:      None,
            validation_price: None,
            validated_at:     None,
            change_pct:       None,
            outcome:          SignalOutcome::Unknown,
        });
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    /// Settle every pending record against `current_price`. Returns how many
    /// records were settled.
    pub fn validate(&mut self, current_price: f64, timestamp: DateTime<Utc>) -> usize {
        let mut settled = 0;
        for rec in self.records.iter_mut().filter(|r| !r.is_validated() && r.entry_price > 0.0) {
            let pct = (current_price - rec.entry_price) / rec.entry_price * 100.0;
            rec.validation_price = Some(current_price);
            rec.validated_at = Some(timestamp);
            rec.change_pct = Some(pct);
            rec.outcome = if rec.signal.judge(pct) { SignalOutcome::Success } else { SignalOutcome::Fail };
            settled += 1;
        }
        settled
    }

    /// Accuracy over the most recent `window` validated records.
    pub fn accuracy(&self, window: usize) -> Accuracy {
        let validated: Vec<&SignalRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| r.outcome != SignalOutcome::Unknown)
            .take(window)
            .collect();

        let mut overall = Tally::default();
        let mut by_signal = Signal::ALL.map(|s| (s, Tally::default()));
        let mut by_confidence = Confidence::ALL.map(|c| (c, Tally::default()));
        let mut by_leverage = LeverageBucket::ALL.map(|b| (b, Tally::default()));

        for rec in validated {
            let ok = rec.outcome == SignalOutcome::Success;
            overall.add(ok);
            if let Some((_, t)) = by_signal.iter_mut().find(|(s, _)| *s == rec.signal) {
                t.add(ok);
            }
            if let Some((_, t)) = by_confidence.iter_mut().find(|(c, _)| *c == rec.confidence) {
                t.add(ok);
            }
            if let Some(bucket) = LeverageBucket::of(rec.leverage) {
                if let Some((_, t)) = by_leverage.iter_mut().find(|(b, _)| *b == bucket) {
                    t.add(ok);
                }
            }
        }

        Accuracy {
            window,
            overall,
            by_signal: by_signal.to_vec(),
            by_confidence: by_confidence.to_vec(),
            by_leverage: by_leverage.to_vec(),
        }
    }

    /// Fixed-width table of the last `n` records, newest last.
    pub fn history_table(&self, n: usize) -> String {
        let recent = self.recent(n);
        if recent.is_empty() {
            return "  (no signal history)\n".to_owned();
        }
        let total = recent.len() as i64;
        let mut lines = vec!["   #  SIG  CONF   LEV     ENTRY     CHECK   CHANGE  RES".to_owned()];
        for (i, r) in recent.iter().enumerate() {
            let mark = match r.outcome {
                SignalOutcome::Success => '✓',
                SignalOutcome::Fail    => '✗',
                SignalOutcome::Unknown => '·',
            };
            lines.push(format!(
                "  {:>3}  {:<4} {:<6} {:>3}x  {:>9}  {:>9}  {:>7}   {}",
                i as i64 - total,
                r.signal.as_str(),
                r.confidence.as_str(),
                r.leverage,
                format_price(Some(r.entry_price)),
                format_price(r.validation_price),
                r.change_pct.map(|p| format!("{p:+.2}%")).unwrap_or_else(|| "--".into()),
                mark,
            ));
        }
        lines.join("\n")
    }

    /// Rolling windows plus the breakdowns over the widest window.
    pub fn accuracy_summary(&self) -> String {
        let mut lines = vec!["  ACCURACY".to_owned(), "  windows:".to_owned()];
        for w in ACCURACY_WINDOWS {
            lines.push(format!("  - last {w:<2}: {}", self.accuracy(w).overall));
        }
        let widest = self.accuracy(ACCURACY_WINDOWS[ACCURACY_WINDOWS.len() - 1]);
        lines.push("  by signal:".into());
        for (s, t) in &widest.by_signal {
            lines.push(format!("  - {:<6}: {t}", s.as_str()));
        }
        lines.push("  by confidence:".into());
        for (c, t) in &widest.by_confidence {
            lines.push(format!("  - {:<6}: {t}", c.as_str()));
        }
        lines.push("  by leverage:".into());
        for (b, t) in &widest.by_leverage {
            lines.push(format!("  - {:<6}: {t}", b.label()));
        }
        lines.join("\n")
    }
}

fn format_price(v: Option<f64>) -> String {
    match v {
        Some(p) => format!("{p:.2}"),
        None => "--".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn settle(signal: Signal, entry: f64, now: f64) -> SignalOutcome {
        let mut ledger = SignalLedger::new();
        ledger.record(signal, Confidence::Medium, 10, entry, t0());
        ledger.validate(now, t0() + Duration::minutes(5));
        ledger.last().unwrap().outcome
    }

    #[test]
    fn validation_law() {
        assert_eq!(settle(Signal::Buy, 100.0, 101.0), SignalOutcome::Success);
        assert_eq!(settle(Signal::Buy, 100.0, 99.0), SignalOutcome::Fail);
        assert_eq!(settle(Signal::Buy, 100.0, 100.0), SignalOutcome::Success);
        assert_eq!(settle(Signal::Sell, 100.0, 99.0), SignalOutcome::Success);
        assert_eq!(settle(Signal::Sell, 100.0, 101.0), SignalOutcome::Fail);
        assert_eq!(settle(Signal::Hold, 100.0, 100.3), SignalOutcome::Success);
        assert_eq!(settle(Signal::Hold, 100.0, 100.6), SignalOutcome::Fail);
        assert_eq!(settle(Signal::Hold, 100.0, 99.6), SignalOutcome::Success);
    }

    #[test]
    fn validation_happens_once() {
        let mut ledger = SignalLedger::new();
        ledger.record(Signal::Buy, Confidence::High, 10, 100.0, t0());
        assert_eq!(ledger.validate(101.0, t0()), 1);
        // a later, contradicting price does not flip the outcome
        assert_eq!(ledger.validate(50.0, t0()), 0);
        let r = ledger.last().unwrap();
        assert_eq!(r.outcome, SignalOutcome::Success);
        assert_eq!(r.validation_price, Some(101.0));
        assert!((r.change_pct.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut ledger = SignalLedger::new();
        for i in 0..(LEDGER_CAPACITY + 5) {
            ledger.record(Signal::Hold, Confidence::Low, 5, 100.0 + i as f64, t0());
        }
        assert_eq!(ledger.len(), LEDGER_CAPACITY);
        assert_eq!(ledger.records().next().unwrap().entry_price, 105.0);
    }

    #[test]
    fn accuracy_uses_the_most_recent_validated_records() {
        let mut ledger = SignalLedger::new();
        // 5 old failures, then 10 successes
        for _ in 0..5 {
            ledger.record(Signal::Buy, Confidence::High, 5, 100.0, t0());
        }
        ledger.validate(90.0, t0());
        for _ in 0..10 {
            ledger.record(Signal::Sell, Confidence::Low, 15, 100.0, t0());
        }
        ledger.validate(90.0, t0());
        // pending record is ignored
        ledger.record(Signal::Buy, Confidence::High, 10, 90.0, t0());

        let last10 = ledger.accuracy(10);
        assert_eq!(last10.overall, Tally { total: 10, success: 10 });

        let all = ledger.accuracy(50);
        assert_eq!(all.overall, Tally { total: 15, success: 10 });
        assert_eq!(all.by_signal[0], (Signal::Buy, Tally { total: 5, success: 0 }));
        assert_eq!(all.by_signal[1], (Signal::Sell, Tally { total: 10, success: 10 }));
        assert_eq!(all.by_confidence[0], (Confidence::High, Tally { total: 5, success: 0 }));
        assert_eq!(all.by_leverage[0], (LeverageBucket::Low, Tally { total: 5, success: 0 }));
        assert_eq!(all.by_leverage[2], (LeverageBucket::High, Tally { total: 10, success: 10 }));
        assert_eq!(all.by_leverage[1].1.ratio(), None);
    }

    #[test]
    fn leverage_buckets() {
        assert_eq!(LeverageBucket::of(2), None);
        assert_eq!(LeverageBucket::of(3), Some(LeverageBucket::Low));
        assert_eq!(LeverageBucket::of(8), Some(LeverageBucket::Low));
        assert_eq!(LeverageBucket::of(9), Some(LeverageBucket::Mid));
        assert_eq!(LeverageBucket::of(12), Some(LeverageBucket::Mid));
        assert_eq!(LeverageBucket::of(13), Some(LeverageBucket::High));
        assert_eq!(LeverageBucket::of(21), None);
    }

    #[test]
    fn tally_display() {
        assert_eq!(Tally::default().to_string(), "-- (--/0)");
        assert_eq!(Tally { total: 4, success: 3 }.to_string(), "75% (3✓/4)");
    }

    #[test]
    fn history_table_numbers_back_from_newest() {
        let mut ledger = SignalLedger::new();
        assert!(ledger.history_table(50).contains("no signal history"));
        ledger.record(Signal::Buy, Confidence::High, 10, 100.0, t0());
        ledger.record(Signal::Sell, Confidence::Low, 5, 101.0, t0());
        let table = ledger.history_table(50);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].trim_start().starts_with("-2"));
        assert!(lines[2].contains("SELL"));
    }
}
