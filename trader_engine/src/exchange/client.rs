/// exchange/client.rs — Signed OKX v5 REST client
///
/// REQUEST FLOW:
///   1. Wait for the request spacer (minimum gap between calls)
///   2. Build requestPath (GET: + sorted query) or compact sorted body (POST)
///   3. Sign `timestamp + METHOD + requestPath + body` with HMAC-SHA256 → base64
///   4. Send with OK-ACCESS-{KEY,SIGN,TIMESTAMP,PASSPHRASE} headers
///   5. Classify: code "0" → payload, 51008 / margin wording → MarginInsufficient,
///      anything else → Protocol
///
/// One client per model: it owns that model's credentials and its own spacer.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::error::{Result, TraderError};
use crate::exchange::rate_limit::RequestSpacer;
use crate::exchange::signing::{self, HttpMethod, SignedRequest};
use crate::exchange::types::{
    parse_balance, parse_candles, parse_instrument, parse_order_ack, parse_position,
    AccountBalance, Candle, Credentials, LotSpec, OrderAck, OrderRequest, Position,
};
use crate::exchange::Exchange;

const API_PREFIX: &str = "/api/v5";

pub struct OkxClient {
    client:      Client,
    credentials: Credentials,
    base_url:    String,
    simulated:   bool,
    spacer:      RequestSpacer,
}

impl OkxClient {
    pub fn new(credentials: Credentials, cfg: &ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| TraderError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            credentials,
            base_url:  cfg.rest_url.trim_end_matches('/').to_owned(),
            simulated: cfg.simulated,
            spacer:    RequestSpacer::new(Duration::from_millis(cfg.min_request_interval_ms)),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Sign and send one request; returns the decoded envelope on code "0".
    ///
    /// `endpoint` is relative to `/api/v5`, e.g. `account/balance`.
    pub async fn send(
        &self,
        method:   HttpMethod,
        endpoint: &str,
        params:   &[(&str, &str)],
        body:     Option<&Value>,
    ) -> Result<Value> {
        self.spacer.wait().await;

        let path = format!("{API_PREFIX}/{endpoint}");
        let signed = signing::sign_request(
            self.credentials.secret(),
            method,
            &path,
            params,
            body,
            signing::timestamp(Utc::now()),
        )?;
        debug!(method = method.as_str(), path = %signed.request_path, "OKX request");

        let resp = self.transmit(&signed).await?;
        let status = resp.status();
        let text = resp.text().await?;

        let envelope: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                let code = if status.is_success() { "decode".to_owned() } else { format!("http-{}", status.as_u16()) };
                return Err(TraderError::Protocol { code, msg: format!("{e}: {}", truncate(&text, 200)) });
            }
        };
        classify(envelope)
    }

    async fn transmit(&self, signed: &SignedRequest) -> Result<reqwest::Response> {
        // The signed request path goes on the wire verbatim; no re-encoding.
        let url = format!("{}{}", self.base_url, signed.request_path);
        let mut req = match signed.method {
            HttpMethod::Get  => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url).body(signed.body.clone()),
        };
        req = req
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", &signed.signature)
            .header("OK-ACCESS-TIMESTAMP", &signed.timestamp)
            .header("OK-ACCESS-PASSPHRASE", self.credentials.passphrase())
            .header("Content-Type", "application/json");
        if let Some(sub) = &self.credentials.sub_account {
            req = req.header("OK-ACCESS-SUBACCOUNT", sub);
        }
        if self.simulated {
            req = req.header("x-simulated-trading", "1");
        }
        Ok(req.send().await?)
    }
}

/// Map the `{code, msg, data}` envelope to payload or typed error.
fn classify(envelope: Value) -> Result<Value> {
    let code = match envelope.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_owned(),
    };
    if code == "0" {
        return Ok(envelope);
    }
    // Batch-style failures put the real reason in data[0].sCode / sMsg.
    if let Some(first) = envelope.get("data").and_then(Value::as_array).and_then(|d| d.first()) {
        if let Some(s_code) = first.get("sCode").and_then(Value::as_str).filter(|c| *c != "0" && !c.is_empty()) {
            let s_msg = first.get("sMsg").and_then(Value::as_str).unwrap_or_default();
            return Err(TraderError::from_business_code(s_code, s_msg));
        }
    }
    let msg = envelope.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
    Err(TraderError::from_business_code(&code, msg))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[async_trait]
impl Exchange for OkxClient {
    async fn fetch_candles(&self, inst_id: &str, bar: &str, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.to_string();
        let resp = self
            .send(HttpMethod::Get, "market/candles", &[("instId", inst_id), ("bar", bar), ("limit", &limit)], None)
            .await?;
        parse_candles(&resp)
    }

    async fn fetch_instrument(&self, inst_id: &str) -> Result<LotSpec> {
        let resp = self
            .send(HttpMethod::Get, "public/instruments", &[("instType", "SWAP"), ("instId", inst_id)], None)
            .await?;
        parse_instrument(&resp, inst_id)
    }

    async fn fetch_balance(&self, ccy: &str) -> Result<AccountBalance> {
        let resp = self.send(HttpMethod::Get, "account/balance", &[("ccy", ccy)], None).await?;
        Ok(parse_balance(&resp, ccy))
    }

    async fn fetch_position(&self, inst_id: &str, default_leverage: u32) -> Result<Option<Position>> {
        let resp = self
            .send(HttpMethod::Get, "account/positions", &[("instType", "SWAP"), ("instId", inst_id)], None)
            .await?;
        Ok(parse_position(&resp, inst_id, default_leverage))
    }

    async fn set_leverage(&self, inst_id: &str, leverage: u32, margin_mode: &str) -> Result<()> {
        let body = json!({
            "instId":  inst_id,
            "lever":   leverage.to_string(),
            "mgnMode": margin_mode,
        });
        self.send(HttpMethod::Post, "account/set-leverage", &[], Some(&body)).await?;
        info!(inst_id, leverage, margin_mode, "leverage set");
        Ok(())
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        info!(
            inst_id = %order.inst_id,
            side = order.side.as_str(),
            contracts = order.contracts,
            reduce_only = order.reduce_only,
            "placing MARKET order"
        );
        let resp = self.send(HttpMethod::Post, "trade/order", &[], Some(&order.to_body())).await?;
        let ack = parse_order_ack(&resp);
        if let Err(e) = &ack {
            warn!(inst_id = %order.inst_id, error = %e, "order rejected");
        }
        ack
    }
}
