/// decision.rs — Decision provider seam and answer parsing
///
/// The provider is asked for a JSON object
///   {signal, reason, stop_loss, take_profit, confidence, leverage, order_quantity}
///
/// PARSING
///   1. strict parse of the raw answer
///   2. on failure, apply the repair transforms below in order, re-parsing
///      after each one; the first successful parse wins
///   3. if nothing parses → DecisionParse; the cycle falls back to HOLD
///
/// Every transform is a pure `&str → String` function and is idempotent,
/// so the pipeline is safe to re-run on its own output.
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{ProviderConfig, SymbolConfig};
use crate::error::{Result, TraderError};
use crate::ledger::Signal;
use crate::sizing::Confidence;

// ── Decision ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub signal:         Signal,
    pub reason:         String,
    pub stop_loss:      f64,
    pub take_profit:    f64,
    pub confidence:     Confidence,
    pub leverage:       u32,
    /// Suggested size in base units; only a hint for the sizer
    pub order_quantity: Option<f64>,
    pub is_fallback:    bool,
}

/// Conservative HOLD used whenever no usable answer is available.
pub fn fallback_hold(symbol: &SymbolConfig, price: f64, reason: impl Into<String>) -> Decision {
    Decision {
        signal:         Signal::Hold,
        reason:         reason.into(),
        stop_loss:      price * 0.98,
        take_profit:    price * 1.02,
        confidence:     Confidence::Low,
        leverage:       symbol.leverage_default,
        order_quantity: None,
        is_fallback:    true,
    }
}

// ── Repair transforms ────────────────────────────────────────────────────

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("bare key pattern")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern"));

pub type Repair = fn(&str) -> String;

/// Ordered repair pipeline.
pub const REPAIRS: [(&str, Repair); 5] = [
    ("strip_code_fence", strip_code_fence),
    ("extract_object", extract_object),
    ("single_to_double_quotes", single_to_double_quotes),
    ("quote_bare_keys", quote_bare_keys),
    ("drop_trailing_commas", drop_trailing_commas),
];

/// Body of the first ```json / ``` fenced block, if any.
pub fn strip_code_fence(s: &str) -> String {
    let (open, skip) = match (s.find("```json"), s.find("```")) {
        (Some(i), _) => (i, 7),
        (None, Some(i)) => (i, 3),
        _ => return s.to_owned(),
    };
    let body = &s[open + skip..];
    match body.find("```") {
        Some(end) => body[..end].trim().to_owned(),
        None => s.to_owned(),
    }
}

/// Span from the first `{` to the last `}`.
pub fn extract_object(s: &str) -> String {
    match (s.find('{'), s.rfind('}')) {
        (Some(a), Some(b)) if a < b => s[a..=b].to_owned(),
        _ => s.to_owned(),
    }
}

pub fn single_to_double_quotes(s: &str) -> String {
    s.replace('\'', "\"")
}

pub fn quote_bare_keys(s: &str) -> String {
    BARE_KEY.replace_all(s, "$1\"$2\":").into_owned()
}

pub fn drop_trailing_commas(s: &str) -> String {
    TRAILING_COMMA.replace_all(s, "$1").into_owned()
}

/// Strict parse, then the repair pipeline. Only JSON objects are accepted.
pub fn parse_lenient(raw: &str) -> Result<Map<String, Value>> {
    let as_object = |s: &str| match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(m)) => Some(m),
        _ => None,
    };
    if let Some(m) = as_object(raw.trim()) {
        return Ok(m);
    }
    let mut text = raw.trim().to_owned();
    for (name, repair) in REPAIRS {
        text = repair(&text);
        if let Some(m) = as_object(&text) {
            debug!(repair = name, "decision JSON recovered");
            return Ok(m);
        }
    }
    Err(TraderError::DecisionParse(format!("unparseable answer: {}", preview(raw))))
}

fn preview(s: &str) -> String {
    s.chars().take(200).collect()
}

// ── Normalisation ────────────────────────────────────────────────────────

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('x').trim().parse().ok(),
        _ => None,
    }
}

const REQUIRED: [&str; 5] = ["signal", "reason", "stop_loss", "take_profit", "confidence"];

/// Parse and normalise a provider answer for `symbol`.
pub fn parse_decision(raw: &str, symbol: &SymbolConfig) -> Result<Decision> {
    let obj = parse_lenient(raw)?;

    let missing: Vec<&str> = REQUIRED.iter().copied().filter(|k| !obj.contains_key(*k)).collect();
    if !missing.is_empty() {
        return Err(TraderError::DecisionParse(format!("missing fields: {}", missing.join(", "))));
    }

    let signal = obj["signal"]
        .as_str()
        .ok_or_else(|| TraderError::DecisionParse("signal is not a string".into()))?
        .parse::<Signal>()?;
    let confidence = obj["confidence"]
        .as_str()
        .and_then(|c| c.parse::<Confidence>().ok())
        .unwrap_or(Confidence::Medium);
    let reason = match &obj["reason"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let stop_loss = number(&obj["stop_loss"])
        .ok_or_else(|| TraderError::DecisionParse(format!("bad stop_loss {}", obj["stop_loss"])))?;
    let take_profit = number(&obj["take_profit"])
        .ok_or_else(|| TraderError::DecisionParse(format!("bad take_profit {}", obj["take_profit"])))?;
    let leverage = obj
        .get("leverage")
        .and_then(number)
        .filter(|l| l.is_finite() && *l > 0.0)
        .map(|l| symbol.clamp_leverage(l.round() as u32))
        .unwrap_or(symbol.leverage_default);
    let order_quantity = obj
        .get("order_quantity")
        .and_then(number)
        .filter(|q| q.is_finite() && *q > 0.0);

    Ok(Decision {
        signal,
        reason,
        stop_loss,
        take_profit,
        confidence,
        leverage,
        order_quantity,
        is_fallback: false,
    })
}

// ── Provider seam ────────────────────────────────────────────────────────

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// Raw answer text for one system + user prompt pair.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsProvider {
    client: Client,
    cfg:    ProviderConfig,
}

impl ChatCompletionsProvider {
    pub fn new(cfg: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| TraderError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl DecisionProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        &self.cfg.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "temperature": self.cfg.temperature,
            "stream": false,
        });
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.cfg.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(model = %self.cfg.model, status = status.as_u16(), "decision provider error");
            return Err(TraderError::Protocol {
                code: format!("provider-{}", status.as_u16()),
                msg:  preview(&text),
            });
        }
        let v: Value = resp.json().await?;
        v.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_owned)
            .ok_or_else(|| TraderError::DecisionParse("provider returned an empty answer".into()))
    }
}

// ── Sentiment seam ───────────────────────────────────────────────────────

/// Optional one-line market-sentiment annotation for the prompt.
#[async_trait]
pub trait SentimentFeed: Send + Sync {
    async fn annotate(&self, asset: &str) -> Option<String>;
}

/// Feed that never has data.
pub struct NoSentiment;

#[async_trait]
impl SentimentFeed for NoSentiment {
    async fn annotate(&self, _asset: &str) -> Option<String> {
        None
    }
}
