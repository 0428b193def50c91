/// prompt.rs — Decision prompt rendering
///
/// Sections, in order:
///   runtime stats → 20-bar series (oldest → newest) → signal history table
///   → accuracy summary → current market and position → suggestion table
///   → decision rules → JSON answer schema
use std::fmt::Write as _;

use crate::config::SymbolConfig;
use crate::exchange::{Position, PositionSide};
use crate::ledger::SignalLedger;
use crate::market::MarketSnapshot;
use crate::sizing::{Confidence, SuggestionTable};

pub const SERIES_BARS: usize = 20;
pub const HISTORY_ROWS: usize = 50;

pub const SYSTEM_PROMPT: &str = "You are a disciplined crypto perpetual-swap analyst. \
Judge the trend from the supplied series and your own verified track record. \
Pick order quantities only from the suggestion table. \
Answer with a single JSON object and nothing else.";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuntimeStats {
    pub uptime_minutes: i64,
    pub ai_calls:       u64,
    pub trades_opened:  u64,
    pub trades_closed:  u64,
    pub open_positions: usize,
}

pub struct PromptInput<'a> {
    pub symbol:      &'a SymbolConfig,
    pub market:      &'a MarketSnapshot,
    pub ledger:      &'a SignalLedger,
    pub suggestions: &'a SuggestionTable,
    pub position:    Option<&'a Position>,
    pub sentiment:   Option<&'a str>,
    pub stats:       RuntimeStats,
}

// ── Formatting helpers ───────────────────────────────────────────────────

/// Integers without decimals, otherwise up to `decimals` with trailing zeros cut.
pub fn format_number(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return "--".into();
    }
    if (value - value.round()).abs() < 1e-6 {
        return format!("{}", value.round() as i64);
    }
    let s = format!("{value:.decimals$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_owned()
    } else {
        s
    }
}

/// Bracketed list, ten values per line.
pub fn format_sequence(values: &[f64], decimals: usize) -> String {
    if values.is_empty() {
        return "  []".into();
    }
    let parts: Vec<String> = values.iter().map(|&v| format_number(v, decimals)).collect();
    let chunks: Vec<String> = parts.chunks(10).map(|c| c.join(", ")).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let open = if i == 0 { "  [" } else { "   " };
            let close = if i == last { "]" } else { "," };
            format!("{open}{chunk}{close}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn tail(values: &[f64]) -> &[f64] {
    &values[values.len().saturating_sub(SERIES_BARS)..]
}

// ── Sections ─────────────────────────────────────────────────────────────

pub fn suggestion_section(table: &SuggestionTable, symbol: &SymbolConfig) -> String {
    let asset = symbol.base_asset();
    let mut out = String::new();
    let _ = writeln!(out, "  POSITION SUGGESTIONS (precomputed, copy a quantity from here)");
    let _ = writeln!(
        out,
        "  available {:.2} USDT | usable margin {:.2} USDT | price ${:.2} | minimum {} {asset} ({} contracts)",
        table.available,
        table.usable_margin,
        table.price,
        format_number(table.min_base, 6),
        format_number(table.min_contracts, 3),
    );
    let leverages = [symbol.leverage_min, symbol.leverage_default, symbol.leverage_max];
    for confidence in Confidence::ALL {
        let _ = writeln!(
            out,
            "\n  {} confidence ({:.0}% of usable margin):",
            confidence.as_str(),
            confidence.margin_ratio() * 100.0
        );
        for lev in leverages {
            let Some(row) = table.get(confidence, lev) else { continue };
            let flag = if row.feasible() { "OK" } else { "NO" };
            let min_note = if row.meets_min { "meets minimum" } else { "below minimum" };
            let margin_note = if row.meets_margin { "margin ok" } else { "margin short" };
            let _ = writeln!(
                out,
                "  - {lev}x: {:.6} {asset} ({} contracts, value ${:.2}), needs {:.2} USDT [{flag}] {min_note}, {margin_note}",
                row.base_qty,
                format_number(row.contracts, 3),
                row.value,
                row.margin,
            );
        }
    }
    out
}

fn position_line(position: Option<&Position>, asset: &str) -> String {
    match position {
        None => "flat".into(),
        Some(p) => format!(
            "{} {} contracts {asset} @ {}, {}x, unrealized {} USDT",
            match p.side {
                PositionSide::Long  => "LONG",
                PositionSide::Short => "SHORT",
            },
            format_number(p.contracts, 3),
            format_number(p.entry_price, 2),
            p.leverage,
            format_number(p.unrealized_pnl, 2),
        ),
    }
}

fn answer_schema(symbol: &SymbolConfig) -> String {
    format!(
        "  Reply with JSON only:\n  {{\n    \"signal\": \"BUY|SELL|HOLD\",\n    \"reason\": \"trend + track-record reasoning, under 50 words\",\n    \"stop_loss\": <price>,\n    \"take_profit\": <price>,\n    \"confidence\": \"HIGH|MEDIUM|LOW\",\n    \"leverage\": <integer {}-{}>,\n    \"order_quantity\": <quantity copied from the suggestion table, 6 decimals>\n  }}",
        symbol.leverage_min, symbol.leverage_max
    )
}

// ── Prompt ───────────────────────────────────────────────────────────────

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let PromptInput { symbol, market, ledger, suggestions, position, sentiment, stats } = input;
    let asset = symbol.base_asset();
    let s = &market.series;
    let mut out = String::new();

    let _ = writeln!(out, "  {} {} analysis\n", symbol.display, symbol.timeframe);
    let _ = writeln!(
        out,
        "  RUNTIME\n  uptime {} min ({:.1} h) | AI calls {} | opened {} | closed {} | open positions {}\n",
        stats.uptime_minutes,
        stats.uptime_minutes as f64 / 60.0,
        stats.ai_calls,
        stats.trades_opened,
        stats.trades_closed,
        stats.open_positions,
    );
    let _ = writeln!(out, "  All series below are ordered oldest → newest.\n");
    let _ = writeln!(out, "  LAST {SERIES_BARS} BARS");
    let closes: Vec<f64> = market.candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = market.candles.iter().map(|c| c.volume).collect();
    let series = [
        ("close (USDT)", closes.as_slice()),
        ("SMA 5", s.sma5.as_slice()),
        ("SMA 20", s.sma20.as_slice()),
        ("RSI 14", s.rsi.as_slice()),
        ("MACD", s.macd.as_slice()),
        ("volume", volumes.as_slice()),
    ];
    for (label, values) in series {
        let _ = writeln!(out, "  {label}:\n{}", format_sequence(tail(values), 2));
    }

    let _ = writeln!(out, "\n  YOUR RECENT CALLS, last {HISTORY_ROWS} (oldest → newest)");
    let _ = writeln!(out, "{}\n", ledger.history_table(HISTORY_ROWS));
    let _ = writeln!(out, "{}\n", ledger.accuracy_summary());

    let _ = writeln!(out, "  MARKET NOW");
    let _ = writeln!(out, "  price: ${} ({:+.2}% last bar)", format_number(market.price, 4), market.price_change_pct);
    let _ = writeln!(out, "  support / resistance: {} / {}", format_number(market.support, 4), format_number(market.resistance, 4));
    let _ = writeln!(out, "  position: {}", position_line(*position, asset));
    let _ = writeln!(out, "  sentiment: {}", sentiment.unwrap_or("no data"));
    let _ = writeln!(
        out,
        "  short term: {:?} | medium term: {:?} | MACD {} | overall {:?}",
        market.trend.short_term,
        market.trend.medium_term,
        if market.trend.macd_bullish { "bullish" } else { "bearish" },
        market.trend.overall,
    );
    let _ = writeln!(
        out,
        "  RSI {:.2} | MACD {:.2} | Bollinger position {:.2}\n",
        market.last_rsi(),
        s.macd.last().copied().unwrap_or(0.0),
        market.bollinger_position(),
    );

    out.push_str(&suggestion_section(suggestions, symbol));
    out.push_str(
        "\n  RULES\n  1. weigh the 20-bar indicators against your verified accuracy\n  2. favour the confidence tiers that have actually been right and size leverage to match\n  3. with an open position decide whether to keep it or close it\n  4. take order_quantity from the suggestion table, do not compute your own\n\n",
    );
    out.push_str(&answer_schema(symbol));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingConfig;
    use crate::ledger::Signal;
    use crate::sizing::PositionSizer;
    use crate::testkit::{account, btc_lot, candles};
    use chrono::Utc;

    #[test]
    fn numbers_drop_noise() {
        assert_eq!(format_number(3.0, 2), "3");
        assert_eq!(format_number(3.10, 2), "3.1");
        assert_eq!(format_number(50_123.456, 2), "50123.46");
        assert_eq!(format_number(f64::NAN, 2), "--");
    }

    #[test]
    fn sequences_wrap_every_ten_values() {
        let values: Vec<f64> = (1..=12).map(f64::from).collect();
        assert_eq!(
            format_sequence(&values, 2),
            "  [1, 2, 3, 4, 5, 6, 7, 8, 9, 10,\n   11, 12]"
        );
        assert_eq!(format_sequence(&[], 2), "  []");
    }

    #[test]
    fn prompt_carries_every_section() {
        let btc = SymbolConfig::builtin("BTC-USDT-SWAP").unwrap();
        let market = MarketSnapshot::from_candles(&btc, candles(50_000.0, 60), Utc::now()).unwrap();
        let mut ledger = SignalLedger::new();
        ledger.record(Signal::Buy, Confidence::High, 10, 49_000.0, Utc::now());
        ledger.validate(50_000.0, Utc::now());
        let table = PositionSizer::new(SizingConfig::default()).suggestions(
            &account(1000.0),
            market.price,
            &btc_lot(),
            &[btc.leverage_min, btc.leverage_default, btc.leverage_max],
        );
        let prompt = build_prompt(&PromptInput {
            symbol: &btc,
            market: &market,
            ledger: &ledger,
            suggestions: &table,
            position: None,
            sentiment: Some("fear & greed 40"),
            stats: RuntimeStats { uptime_minutes: 90, ai_calls: 7, ..Default::default() },
        });

        assert!(prompt.contains("uptime 90 min (1.5 h) | AI calls 7"));
        assert!(prompt.contains("close (USDT):\n  [50040, 50041"));
        assert!(prompt.contains("position: flat"));
        assert!(prompt.contains("sentiment: fear & greed 40"));
        assert!(prompt.contains("HIGH confidence (70% of usable margin)"));
        assert!(prompt.contains("- 20x:"));
        assert!(prompt.contains("\"order_quantity\""));
        assert!(prompt.contains("<integer 3-20>"));
        assert!(prompt.contains("ACCURACY"));
    }

    #[test]
    fn infeasible_rows_are_flagged() {
        let btc = SymbolConfig::builtin("BTC-USDT-SWAP").unwrap();
        let table = PositionSizer::new(SizingConfig::default()).suggestions(&account(30.0), 50_000.0, &btc_lot(), &[3, 10, 20]);
        let text = suggestion_section(&table, &btc);
        assert!(text.contains("[NO]"));
        assert!(!text.contains("[OK]"));
        assert!(text.contains("margin short"));
    }
}
