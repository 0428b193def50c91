/// cycle.rs — One decision cycle for one (model, instrument)
///
/// FLOW
///   candles → market snapshot → lot spec → balance → position
///   → settle pending ledger records at the current price
///   → suggestion table (no feasible row → record LOW HOLD, stop)
///   → sentiment → prompt → provider → parse (any failure → fallback HOLD)
///   → record signal → execute
///
/// Market-data and account-read failures end the cycle with an error; the
/// scheduler logs it. Provider and parse failures never do.
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::SymbolConfig;
use crate::context::{DecisionEntry, Freshness, ModelContext};
use crate::decision::{fallback_hold, parse_decision, Decision, SentimentFeed};
use crate::error::Result;
use crate::execution::{ExecutionEngine, ExecutionOutcome, PositionState};
use crate::market::MarketSnapshot;
use crate::prompt::{build_prompt, PromptInput, SYSTEM_PROMPT};
use crate::sizing::apply_min_base;

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub inst_id:  String,
    pub price:    f64,
    pub decision: Decision,
    pub outcome:  ExecutionOutcome,
}

pub async fn run_symbol_cycle(
    ctx:       &ModelContext,
    engine:    &ExecutionEngine,
    sentiment: &dyn SentimentFeed,
    symbol:    &SymbolConfig,
    now:       DateTime<Utc>,
) -> Result<CycleReport> {
    let model = ctx.key.as_str();
    let inst = symbol.inst_id.as_str();

    let candles = ctx
        .exchange()
        .fetch_candles(inst, &symbol.timeframe, symbol.candle_limit)
        .await?;
    let market = MarketSnapshot::from_candles(symbol, candles, now)?;
    let price = market.price;
    let lot = apply_min_base(&ctx.lot_spec(symbol).await?, symbol.min_base_amount);
    let balance = ctx.balance(Freshness::Cached).await?;
    let position = ctx.position(symbol).await?;

    let settled = ctx.with_symbol(symbol, |s| {
        s.last_price = price;
        s.ledger.validate(price, now)
    });
    if settled > 0 {
        debug!(model, inst, settled, "ledger records validated");
    }

    let leverages = [symbol.leverage_min, symbol.leverage_default, symbol.leverage_max];
    let table = engine.sizer().suggestions(&balance, price, &lot, &leverages);

    let decision = if !table.can_trade() {
        let need = table.required_balance(symbol.leverage_max);
        warn!(model, inst, usable = table.usable_margin, "insufficient balance, minimum order needs ~{need:.2} USDT");
        fallback_hold(symbol, price, format!("insufficient balance: minimum order needs ~{need:.2} USDT"))
    } else {
        let note = sentiment.annotate(symbol.base_asset()).await;
        let ledger = ctx.with_symbol(symbol, |s| s.ledger.clone());
        let prompt = build_prompt(&PromptInput {
            symbol,
            market: &market,
            ledger: &ledger,
            suggestions: &table,
            position: position.as_ref(),
            sentiment: note.as_deref(),
            stats: ctx.runtime_stats(now),
        });
        ask_provider(ctx, symbol, &prompt, price).await
    };

    ctx.with_symbol(symbol, |s| {
        let rec = s
            .ledger
            .record(decision.signal, decision.confidence, decision.leverage, price, now);
        rec.reason = decision.reason.clone();
        rec.stop_loss = Some(decision.stop_loss);
        rec.take_profit = Some(decision.take_profit);
        s.log_decision(DecisionEntry { timestamp: now, price, decision: decision.clone() });
    });
    ctx.bump(|c| c.signals_generated += 1);
    info!(
        model, inst,
        "signal {} {} {}x @ {:.4}{}",
        decision.signal, decision.confidence, decision.leverage, price,
        if decision.is_fallback { " (fallback)" } else { "" }
    );

    let outcome = if table.can_trade() {
        engine.execute(ctx, symbol, &lot, &decision, price, position.as_ref()).await
    } else {
        ExecutionOutcome::NoAction { state: PositionState::of(position.as_ref()) }
    };

    Ok(CycleReport { inst_id: symbol.inst_id.clone(), price, decision, outcome })
}

async fn ask_provider(ctx: &ModelContext, symbol: &SymbolConfig, prompt: &str, price: f64) -> Decision {
    ctx.bump(|c| c.ai_calls += 1);
    let raw = match ctx.provider().complete(SYSTEM_PROMPT, prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            ctx.bump(|c| c.ai_errors += 1);
            warn!(model = %ctx.key, inst = %symbol.inst_id, provider = ctx.provider().name(), "provider call failed: {e}");
            return fallback_hold(symbol, price, format!("provider unavailable: {e}"));
        }
    };
    match parse_decision(&raw, symbol) {
        Ok(d) => d,
        Err(e) => {
            ctx.bump(|c| c.ai_errors += 1);
            warn!(model = %ctx.key, inst = %symbol.inst_id, "unusable provider answer: {e}");
            fallback_hold(symbol, price, format!("unparseable answer: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{ExecutionConfig, SizingConfig};
    use crate::decision::NoSentiment;
    use crate::execution::ExecutionLock;
    use crate::ledger::Signal;
    use crate::sizing::{Confidence, PositionSizer};
    use crate::testkit::{MockExchange, StaticProvider};

    const BUY: &str = r#"```json
{"signal": "buy", "reason": "higher lows", "stop_loss": 49000, "take_profit": 52000,
 "confidence": "HIGH", "leverage": 10, "order_quantity": 0.053}
```"#;

    fn btc() -> SymbolConfig {
        SymbolConfig::builtin("BTC-USDT-SWAP").unwrap()
    }

    fn setup(ex: Arc<MockExchange>, provider: Arc<StaticProvider>) -> (ModelContext, ExecutionEngine) {
        let cfg = ExecutionConfig {
            dry_run: false,
            settle_delay_ms: 0,
            margin_backoff_ms: 0,
            transient_backoff_ms: 0,
            ..Default::default()
        };
        let ctx = ModelContext::new("qwen", "Qwen", ex, provider, &[btc()], &cfg);
        let engine = ExecutionEngine::new(PositionSizer::new(SizingConfig::default()), cfg, ExecutionLock::new());
        (ctx, engine)
    }

    #[tokio::test]
    async fn decision_is_recorded_and_executed() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let provider = Arc::new(StaticProvider::new(BUY));
        let (ctx, engine) = setup(ex.clone(), provider.clone());

        let report = run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        assert_eq!(report.decision.signal, Signal::Buy);
        assert!(matches!(report.outcome, ExecutionOutcome::Opened { .. }), "{:?}", report.outcome);
        assert_eq!(ex.orders().len(), 1);
        assert_eq!(provider.prompts().len(), 1);

        let c = ctx.counters();
        assert_eq!((c.ai_calls, c.ai_errors, c.signals_generated, c.trades_opened), (1, 0, 1, 1));
        let rec = ctx.with_symbol(&btc(), |s| s.ledger.last().cloned()).unwrap();
        assert_eq!(rec.reason, "higher lows");
        assert_eq!(rec.take_profit, Some(52_000.0));
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_hold() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let (ctx, engine) = setup(ex.clone(), Arc::new(StaticProvider::failing()));

        let report = run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        assert!(report.decision.is_fallback);
        assert_eq!(report.decision.signal, Signal::Hold);
        assert_eq!(report.decision.confidence, Confidence::Low);
        assert!(ex.orders().is_empty());
        assert_eq!(ctx.counters().ai_errors, 1);
    }

    #[tokio::test]
    async fn garbage_answer_falls_back_to_hold() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        let (ctx, engine) = setup(ex.clone(), Arc::new(StaticProvider::new("I think BTC goes up.")));

        let report = run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        assert!(report.decision.is_fallback);
        assert!(ex.orders().is_empty());
    }

    #[tokio::test]
    async fn insufficient_balance_skips_the_provider() {
        let ex = Arc::new(MockExchange::with_equity(30.0));
        let provider = Arc::new(StaticProvider::new(BUY));
        let (ctx, engine) = setup(ex.clone(), provider.clone());

        let report = run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        assert!(provider.prompts().is_empty());
        assert_eq!(report.decision.signal, Signal::Hold);
        assert!(report.decision.reason.starts_with("insufficient balance"));
        assert!(matches!(report.outcome, ExecutionOutcome::NoAction { .. }));
        assert_eq!(ctx.counters().ai_calls, 0);
        assert_eq!(ctx.with_symbol(&btc(), |s| s.ledger.len()), 1);
    }

    #[tokio::test]
    async fn next_cycle_validates_previous_signal() {
        let ex = Arc::new(MockExchange::with_equity(30.0));
        let (ctx, engine) = setup(ex.clone(), Arc::new(StaticProvider::failing()));

        run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        assert!(!ctx.with_symbol(&btc(), |s| s.ledger.records().all(|r| r.is_validated())));
        run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.unwrap();
        let validated = ctx.with_symbol(&btc(), |s| s.ledger.records().filter(|r| r.is_validated()).count());
        assert_eq!(validated, 1);
    }

    #[tokio::test]
    async fn missing_market_data_is_an_error() {
        let ex = Arc::new(MockExchange::with_equity(1000.0));
        ex.set_candles(Vec::new());
        let (ctx, engine) = setup(ex.clone(), Arc::new(StaticProvider::new(BUY)));
        assert!(run_symbol_cycle(&ctx, &engine, &NoSentiment, &btc(), Utc::now()).await.is_err());
        assert_eq!(ctx.with_symbol(&btc(), |s| s.ledger.len()), 0);
    }
}
