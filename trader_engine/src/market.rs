/// market.rs — Candle series → indicator snapshot
///
/// ─────────────────────────────────────────────────────────────────────────
/// INDICATORS (computed over the full fetched window, oldest → newest)
/// ─────────────────────────────────────────────────────────────────────────
///
/// SIMPLE MOVING AVERAGE (expanding until the window fills)
///   SMA_n(t) = mean(close[max(0, t−n+1) ..= t])            n ∈ {5, 20, 50}
///
/// EXPONENTIAL MOVING AVERAGE (span form, seeded with the first close)
///   α = 2 / (span + 1)
///   EMA(t) = α·close(t) + (1 − α)·EMA(t−1)
///
/// MACD
///   MACD   = EMA12 − EMA26
///   signal = EMA9(MACD)
///   hist   = MACD − signal
///
/// RSI(14), rolling-mean form
///   gain_t = max(Δclose, 0),  loss_t = max(−Δclose, 0)
///   RS     = mean14(gain) / mean14(loss)
///   RSI    = 100 − 100/(1 + RS)     (100 when there were no losses)
///   Bars before the first full window take the first defined value.
///
/// BOLLINGER (20, 2σ) position
///   pos = (close − lower) / (upper − lower)   ∈ [0, 1] inside the bands
///
/// VOLUME RATIO
///   volume / mean20(volume)
///
/// TREND
///   short  = close > SMA20 ? up : down
///   medium = close > SMA50 ? up : down
///   overall: both up → strong uptrend, both down → strong downtrend,
///            otherwise ranging
/// ─────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SymbolConfig;
use crate::error::{Result, TraderError};
use crate::exchange::Candle;

// ── Series helpers ───────────────────────────────────────────────────────

pub fn sma(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        out.push(sum / (i + 1).min(window) as f64);
    }
    out
}

pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let means = sma(values, window);
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let lo = (i + 1).saturating_sub(window);
            let slice = &values[lo..=i];
            if slice.len() < 2 {
                return 0.0;
            }
            let m = means[i];
            let var = slice.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (slice.len() - 1) as f64;
            var.sqrt()
        })
        .collect()
}

pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut raw: Vec<Option<f64>> = vec![None; n];
    if n > period && period > 0 {
        for (i, slot) in raw.iter_mut().enumerate().skip(period) {
            let (mut gain, mut loss) = (0.0, 0.0);
            for j in (i + 1 - period)..=i {
                let d = closes[j] - closes[j - 1];
                if d > 0.0 { gain += d } else { loss -= d }
            }
            *slot = Some(if loss == 0.0 {
                if gain == 0.0 { 50.0 } else { 100.0 }
            } else {
                100.0 - 100.0 / (1.0 + gain / loss)
            });
        }
    }
    let first = raw.iter().flatten().copied().next().unwrap_or(50.0);
    raw.into_iter().map(|v| v.unwrap_or(first)).collect()
}

// ── Snapshot ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorSeries {
    pub sma5:         Vec<f64>,
    pub sma20:        Vec<f64>,
    pub sma50:        Vec<f64>,
    pub ema12:        Vec<f64>,
    pub ema26:        Vec<f64>,
    pub macd:         Vec<f64>,
    pub macd_signal:  Vec<f64>,
    pub macd_hist:    Vec<f64>,
    pub rsi:          Vec<f64>,
    pub bb_upper:     Vec<f64>,
    pub bb_lower:     Vec<f64>,
    pub volume_ratio: Vec<f64>,
}

impl IndicatorSeries {
    pub fn compute(candles: &[Candle]) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let ema12 = ema(&closes, 12);
        let ema26 = ema(&closes, 26);
        let macd: Vec<f64> = ema12.iter().zip(&ema26).map(|(a, b)| a - b).collect();
        let macd_signal = ema(&macd, 9);
        let macd_hist = macd.iter().zip(&macd_signal).map(|(m, s)| m - s).collect();

        let bb_mid = sma(&closes, 20);
        let bb_std = rolling_std(&closes, 20);
        let bb_upper = bb_mid.iter().zip(&bb_std).map(|(m, s)| m + 2.0 * s).collect();
        let bb_lower = bb_mid.iter().zip(&bb_std).map(|(m, s)| m - 2.0 * s).collect();

        let vol_ma = sma(&volumes, 20);
        let volume_ratio = volumes
            .iter()
            .zip(&vol_ma)
            .map(|(v, m)| if *m > 0.0 { v / m } else { 1.0 })
            .collect();

        Self {
            sma5: sma(&closes, 5),
            sma20: sma(&closes, 20),
            sma50: sma(&closes, 50),
            ema12,
            ema26,
            macd,
            macd_signal,
            macd_hist,
            rsi: rsi(&closes, 14),
            bb_upper,
            bb_lower,
            volume_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallTrend {
    StrongUp,
    StrongDown,
    Ranging,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendSummary {
    pub short_term:   Direction,
    pub medium_term:  Direction,
    pub macd_bullish: bool,
    pub overall:      OverallTrend,
}

impl TrendSummary {
    fn from_last(price: f64, sma20: f64, sma50: f64, macd: f64, signal: f64) -> Self {
        let short_term = if price > sma20 { Direction::Up } else { Direction::Down };
        let medium_term = if price > sma50 { Direction::Up } else { Direction::Down };
        let overall = match (short_term, medium_term) {
            (Direction::Up, Direction::Up) => OverallTrend::StrongUp,
            (Direction::Down, Direction::Down) => OverallTrend::StrongDown,
            _ => OverallTrend::Ranging,
        };
        Self { short_term, medium_term, macd_bullish: macd > signal, overall }
    }
}

/// Everything the decision prompt needs about one instrument right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub inst_id:          String,
    pub display:          String,
    pub timeframe:        String,
    pub timestamp:        DateTime<Utc>,
    pub price:            f64,
    pub high:             f64,
    pub low:              f64,
    pub volume:           f64,
    /// Last bar vs the bar before, percent
    pub price_change_pct: f64,
    pub support:          f64,
    pub resistance:       f64,
    pub candles:          Vec<Candle>,
    pub series:           IndicatorSeries,
    pub trend:            TrendSummary,
}

impl MarketSnapshot {
    pub fn from_candles(symbol: &SymbolConfig, candles: Vec<Candle>, timestamp: DateTime<Utc>) -> Result<Self> {
        let n = candles.len();
        if n < 2 {
            return Err(TraderError::Protocol {
                code: "market-data".into(),
                msg:  format!("{}: need at least 2 candles, got {n}", symbol.inst_id),
            });
        }
        let last = candles[n - 1];
        let prev = candles[n - 2];
        let series = IndicatorSeries::compute(&candles);
        let trend = TrendSummary::from_last(
            last.close,
            series.sma20[n - 1],
            series.sma50[n - 1],
            series.macd[n - 1],
            series.macd_signal[n - 1],
        );
        let lookback = &candles[n.saturating_sub(20)..];
        let resistance = lookback.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let support = lookback.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let price_change_pct = if prev.close > 0.0 { (last.close - prev.close) / prev.close * 100.0 } else { 0.0 };

        Ok(Self {
            inst_id: symbol.inst_id.clone(),
            display: symbol.display.clone(),
            timeframe: symbol.timeframe.clone(),
            timestamp,
            price: last.close,
            high: last.high,
            low: last.low,
            volume: last.volume,
            price_change_pct,
            support,
            resistance,
            candles,
            series,
            trend,
        })
    }

    pub fn last_rsi(&self) -> f64 {
        self.series.rsi.last().copied().unwrap_or(50.0)
    }

    /// Bollinger position of the last close (0 = lower band, 1 = upper).
    pub fn bollinger_position(&self) -> f64 {
        let (Some(u), Some(l)) = (self.series.bb_upper.last(), self.series.bb_lower.last()) else {
            return 0.5;
        };
        if u - l <= f64::EPSILON { 0.5 } else { (self.price - l) / (u - l) }
    }
}
