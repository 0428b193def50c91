/// exchange/types.rs — Typed views of OKX v5 payloads
///
/// OKX encodes every number as a JSON string ("0.01"), sometimes an empty
/// string when the field does not apply. `num()` treats missing, empty and
/// malformed values alike as absent.
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TraderError};

// ── Credentials ──────────────────────────────────────────────────────────

/// Exchange credentials; immutable and owned by one model's client.
pub struct Credentials {
    pub api_key:     String,
    secret:          SecretString,
    passphrase:      SecretString,
    pub sub_account: Option<String>,
}

impl Credentials {
    pub fn new(api_key: &str, secret: &str, passphrase: &str, sub_account: Option<&str>) -> Self {
        Self {
            api_key:     api_key.trim().to_owned(),
            secret:      SecretString::from(secret.trim().to_owned()),
            passphrase:  SecretString::from(passphrase.trim().to_owned()),
            sub_account: sub_account
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn passphrase(&self) -> &str {
        self.passphrase.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chars: Vec<char> = self.api_key.chars().collect();
        let masked = if chars.len() > 12 {
            let head: String = chars[..8].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "***".to_owned()
        };
        f.debug_struct("Credentials")
            .field("api_key", &masked)
            .field("sub_account", &self.sub_account)
            .finish_non_exhaustive()
    }
}

// ── Market data ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, Unix ms
    pub ts:     i64,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    pub volume: f64,
}

/// Lot constraints of one swap instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotSpec {
    pub inst_id:       String,
    /// Base-asset quantity per contract (ctVal)
    pub contract_size: f64,
    /// Contract quantity increment (lotSz)
    pub lot_step:      f64,
    /// Minimum order size in contracts (minSz)
    pub min_contracts: f64,
}

impl LotSpec {
    pub fn contracts_to_base(&self, contracts: f64) -> f64 {
        contracts * self.contract_size
    }

    pub fn base_to_contracts(&self, base: f64) -> f64 {
        if self.contract_size > 0.0 { base / self.contract_size } else { base }
    }
}

// ── Account ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_equity:   f64,
    pub available:      f64,
    /// Initial margin currently reserved by open positions (imr)
    pub used_margin:    f64,
    pub frozen:         f64,
    pub unrealized_pnl: f64,
    pub currency:       String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub inst_id:        String,
    pub side:           PositionSide,
    /// Absolute size in contracts
    pub contracts:      f64,
    pub entry_price:    f64,
    pub unrealized_pnl: f64,
    pub leverage:       u32,
    pub margin:         f64,
}

// ── Orders ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy  => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub inst_id:     String,
    pub side:        OrderSide,
    /// Size in contracts
    pub contracts:   f64,
    pub margin_mode: String,
    pub reduce_only: bool,
    pub tag:         Option<String>,
}

impl OrderRequest {
    pub fn to_body(&self) -> Value {
        let mut body = serde_json::json!({
            "instId":  self.inst_id,
            "tdMode":  self.margin_mode,
            "side":    self.side.as_str(),
            "ordType": "market",
            "sz":      format_size(self.contracts),
        });
        if self.reduce_only {
            body["reduceOnly"] = Value::Bool(true);
        }
        if let Some(tag) = &self.tag {
            body["tag"] = Value::String(tag.clone());
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id:        String,
    pub client_order_id: Option<String>,
}

/// Render a contract count without float noise (`5.300000000001` → `5.3`).
pub fn format_size(contracts: f64) -> String {
    let s = format!("{contracts:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() { "0".to_owned() } else { s.to_owned() }
}

// ── Payload parsing ──────────────────────────────────────────────────────

fn num(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn text(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_owned)
}

fn data_array(resp: &Value) -> &[Value] {
    resp.get("data").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// `market/candles` rows are `[ts, o, h, l, c, vol, ...]`, newest first.
pub fn parse_candles(resp: &Value) -> Result<Vec<Candle>> {
    let mut candles = Vec::new();
    for row in data_array(resp) {
        let cell = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
        let (Some(ts), Some(open), Some(high), Some(low), Some(close), Some(volume)) =
            (cell(0), cell(1), cell(2), cell(3), cell(4), cell(5))
        else {
            return Err(TraderError::Protocol {
                code: "decode".into(),
                msg:  format!("malformed candle row: {row}"),
            });
        };
        candles.push(Candle { ts: ts as i64, open, high, low, close, volume });
    }
    candles.reverse();
    Ok(candles)
}

pub fn parse_instrument(resp: &Value, inst_id: &str) -> Result<LotSpec> {
    let inst = data_array(resp)
        .iter()
        .find(|i| i.get("instId").and_then(Value::as_str) == Some(inst_id))
        .ok_or_else(|| TraderError::Protocol {
            code: "decode".into(),
            msg:  format!("instrument {inst_id} not listed"),
        })?;
    Ok(LotSpec {
        inst_id:       inst_id.to_owned(),
        contract_size: num(inst, "ctVal").filter(|v| *v > 0.0).unwrap_or(1.0),
        lot_step:      num(inst, "lotSz").filter(|v| *v > 0.0).unwrap_or(1.0),
        min_contracts: num(inst, "minSz").filter(|v| *v > 0.0).unwrap_or(1.0),
    })
}

pub fn parse_balance(resp: &Value, ccy: &str) -> AccountBalance {
    let Some(account) = data_array(resp).first() else {
        return AccountBalance { currency: ccy.to_owned(), ..Default::default() };
    };
    let detail = account
        .get("details")
        .and_then(Value::as_array)
        .and_then(|ds| ds.iter().find(|d| d.get("ccy").and_then(Value::as_str) == Some(ccy)));

    let mut bal = AccountBalance { currency: ccy.to_owned(), ..Default::default() };
    if let Some(d) = detail {
        bal.available = num(d, "availBal").or_else(|| num(d, "availEq")).or_else(|| num(d, "eq")).unwrap_or(0.0);
        bal.total_equity = num(d, "eq").or_else(|| num(d, "cashBal")).unwrap_or(0.0);
        bal.frozen = num(d, "frozenBal").unwrap_or(0.0);
        bal.used_margin = num(d, "imr").unwrap_or(0.0);
        bal.unrealized_pnl = num(d, "upl").unwrap_or(0.0);
    }
    if bal.available == 0.0 {
        bal.available = num(account, "availEq").unwrap_or(0.0);
    }
    if bal.total_equity == 0.0 {
        bal.total_equity = num(account, "totalEq").unwrap_or(0.0);
    }
    if bal.used_margin == 0.0 {
        bal.used_margin = num(account, "imr").unwrap_or(0.0);
    }
    bal
}

/// One-way (net) mode: the sign of `pos` gives the side. In hedge mode
/// `posSide` is explicit and `pos` is unsigned.
pub fn parse_position(resp: &Value, inst_id: &str, default_leverage: u32) -> Option<Position> {
    data_array(resp).iter().find_map(|p| {
        if p.get("instId").and_then(Value::as_str) != Some(inst_id) {
            return None;
        }
        let pos = num(p, "pos")?;
        if pos.abs() < 1e-8 {
            return None;
        }
        let side = match p.get("posSide").and_then(Value::as_str) {
            Some("long")  => PositionSide::Long,
            Some("short") => PositionSide::Short,
            _ if pos > 0.0 => PositionSide::Long,
            _ => PositionSide::Short,
        };
        Some(Position {
            inst_id:        inst_id.to_owned(),
            side,
            contracts:      pos.abs(),
            entry_price:    num(p, "avgPx").unwrap_or(0.0),
            unrealized_pnl: num(p, "upl").unwrap_or(0.0),
            leverage:       num(p, "lever").map(|l| l.round() as u32).unwrap_or(default_leverage),
            margin:         num(p, "imr").or_else(|| num(p, "margin")).unwrap_or(0.0),
        })
    })
}

pub fn parse_order_ack(resp: &Value) -> Result<OrderAck> {
    let row = data_array(resp).first().ok_or_else(|| TraderError::Protocol {
        code: "decode".into(),
        msg:  "order response carried no data".into(),
    })?;
    let s_code = text(row, "sCode").unwrap_or_else(|| "0".into());
    if s_code != "0" {
        let s_msg = text(row, "sMsg").unwrap_or_default();
        return Err(TraderError::from_business_code(&s_code, &s_msg));
    }
    Ok(OrderAck {
        order_id:        text(row, "ordId").unwrap_or_default(),
        client_order_id: text(row, "clOrdId"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_masks_api_key() {
        let ascii = Credentials::new("abcdefgh-1234-wxyz", "s", "p", None);
        let out = format!("{ascii:?}");
        assert!(out.contains("abcdefgh...wxyz"));
        assert!(!out.contains("1234"));

        let wide = Credentials::new("ключ-ключ-ключ-ключ", "s", "p", None);
        assert!(format!("{wide:?}").contains("ключ-клю...ключ"));
        assert!(format!("{:?}", Credentials::new("short", "s", "p", None)).contains("***"));
    }

    #[test]
    fn candles_are_reversed_into_chronological_order() {
        let resp = json!({"code": "0", "data": [
            ["1700000600000", "101", "102", "100", "101.5", "12", "0", "0", "1"],
            ["1700000300000", "100", "101", "99", "100.5", "10", "0", "0", "1"],
        ]});
        let c = parse_candles(&resp).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].ts, 1_700_000_300_000);
        assert_eq!(c[1].close, 101.5);
    }

    #[test]
    fn instrument_lot_spec() {
        let resp = json!({"code": "0", "data": [
            {"instId": "ETH-USDT-SWAP", "ctVal": "0.1", "lotSz": "0.01", "minSz": "0.01"},
            {"instId": "BTC-USDT-SWAP", "ctVal": "0.01", "lotSz": "0.1", "minSz": "0.1"},
        ]});
        let spec = parse_instrument(&resp, "BTC-USDT-SWAP").unwrap();
        assert_eq!(spec.contract_size, 0.01);
        assert_eq!(spec.lot_step, 0.1);
        assert_eq!(spec.min_contracts, 0.1);
        assert!(parse_instrument(&resp, "SOL-USDT-SWAP").is_err());
    }

    #[test]
    fn balance_prefers_currency_detail() {
        let resp = json!({"code": "0", "data": [{
            "totalEq": "2000", "availEq": "1500",
            "details": [{"ccy": "USDT", "availBal": "900", "eq": "1000",
                         "frozenBal": "100", "imr": "80", "upl": "-3.5"}]
        }]});
        let b = parse_balance(&resp, "USDT");
        assert_eq!(b.available, 900.0);
        assert_eq!(b.total_equity, 1000.0);
        assert_eq!(b.used_margin, 80.0);
        assert_eq!(b.unrealized_pnl, -3.5);
    }

    #[test]
    fn balance_falls_back_to_account_level() {
        let resp = json!({"code": "0", "data": [{"totalEq": "2000", "availEq": "1500", "details": []}]});
        let b = parse_balance(&resp, "USDT");
        assert_eq!(b.available, 1500.0);
        assert_eq!(b.total_equity, 2000.0);
    }

    #[test]
    fn net_mode_short_position() {
        let resp = json!({"code": "0", "data": [
            {"instId": "BTC-USDT-SWAP", "pos": "-3", "posSide": "net", "avgPx": "50000",
             "upl": "1.2", "lever": "10", "imr": "150"}
        ]});
        let p = parse_position(&resp, "BTC-USDT-SWAP", 5).unwrap();
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.contracts, 3.0);
        assert_eq!(p.leverage, 10);
    }

    #[test]
    fn dust_position_is_ignored() {
        let resp = json!({"code": "0", "data": [{"instId": "BTC-USDT-SWAP", "pos": "0"}]});
        assert!(parse_position(&resp, "BTC-USDT-SWAP", 10).is_none());
    }

    #[test]
    fn order_level_margin_failure() {
        let resp = json!({"code": "1", "data": [{"sCode": "51008", "sMsg": "Order failed. Insufficient margin"}]});
        let err = parse_order_ack(&resp).unwrap_err();
        assert!(matches!(err, TraderError::MarginInsufficient { .. }));
    }

    #[test]
    fn order_body_carries_reduce_only_and_tag() {
        let req = OrderRequest {
            inst_id: "BTC-USDT-SWAP".into(),
            side: OrderSide::Sell,
            contracts: 5.300000000001,
            margin_mode: "cross".into(),
            reduce_only: true,
            tag: Some("abc".into()),
        };
        let body = req.to_body();
        assert_eq!(body["sz"], "5.3");
        assert_eq!(body["reduceOnly"], true);
        assert_eq!(body["ordType"], "market");
        assert_eq!(body["tag"], "abc");
    }
}
