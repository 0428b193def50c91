/// exchange/signing.rs — OKX v5 request signing
///
/// SIGNATURE
///   prehash   = timestamp ∥ METHOD ∥ requestPath(+?sorted query) ∥ body
///   signature = base64( HMAC-SHA256(secret, prehash) )
///
///   GET:  query parameters are part of requestPath, body is always "".
///   POST: body is the compact JSON (no whitespace, keys sorted).
///
/// The strings produced here are the exact bytes transmitted: the client
/// appends `request_path` to the base URL verbatim and sends `body` as the
/// raw request payload. Re-encoding either after signing invalidates the
/// signature.
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{Result, TraderError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// A fully signed request, ready to transmit.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method:       HttpMethod,
    /// Path plus sorted query string, e.g. `/api/v5/account/balance?ccy=USDT`
    pub request_path: String,
    /// Exact payload bytes; empty for GET
    pub body:         String,
    pub timestamp:    String,
    pub signature:    String,
}

impl SignedRequest {
    /// The string that was fed to HMAC.
    pub fn prehash(&self) -> String {
        prehash(&self.timestamp, self.method, &self.request_path, &self.body)
    }
}

/// ISO-8601 UTC with millisecond precision: `2024-01-01T00:00:00.000Z`.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Drop empty values, sort by key, join as `k=v&k2=v2`.
pub fn build_query(params: &[(&str, &str)]) -> String {
    let mut kept: Vec<(&str, &str)> = params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .copied()
        .collect();
    kept.sort_by(|a, b| a.0.cmp(b.0));
    kept.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Request path with the sorted query appended (if any).
pub fn request_path(path: &str, params: &[(&str, &str)]) -> String {
    let query = build_query(params);
    if query.is_empty() {
        path.to_owned()
    } else {
        format!("{path}?{query}")
    }
}

/// Compact JSON with top-level keys sorted. `None` and empty objects encode as "".
pub fn compact_body(body: Option<&Value>) -> Result<String> {
    let Some(body) = body else {
        return Ok(String::new());
    };
    let obj = body
        .as_object()
        .ok_or_else(|| TraderError::Config("request body must be a JSON object".into()))?;
    if obj.is_empty() {
        return Ok(String::new());
    }
    let sorted: BTreeMap<&String, &Value> = obj.iter().collect();
    serde_json::to_string(&sorted).map_err(|e| TraderError::Config(format!("encode body: {e}")))
}

pub fn prehash(timestamp: &str, method: HttpMethod, request_path: &str, body: &str) -> String {
    format!("{timestamp}{}{request_path}{body}", method.as_str())
}

/// base64(HMAC-SHA256(secret, message)).
pub fn sign(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TraderError::Config(format!("HMAC key error: {e}")))?;
    mac.update(message.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Build and sign one request at a fixed timestamp.
pub fn sign_request(
    secret:    &str,
    method:    HttpMethod,
    path:      &str,
    params:    &[(&str, &str)],
    body:      Option<&Value>,
    timestamp: String,
) -> Result<SignedRequest> {
    let (request_path, body) = match method {
        HttpMethod::Get  => (request_path(path, params), String::new()),
        HttpMethod::Post => (path.to_owned(), compact_body(body)?),
    };
    let signature = sign(secret, &prehash(&timestamp, method, &request_path, &body))?;
    Ok(SignedRequest { method, request_path, body, timestamp, signature })
}
