/// error.rs — Typed failures of the trading core
///
/// Every fallible operation in the library returns `Result<T, TraderError>`.
/// The execution engine never inspects error messages: it dispatches on
/// `TraderError::kind()` so that a margin shortfall (shrink the order) and a
/// transient failure (resend the same order) get different retry policies.
use thiserror::Error;

/// Business code the exchange returns when the account lacks margin.
pub const MARGIN_INSUFFICIENT_CODE: &str = "51008";

#[derive(Debug, Error)]
pub enum TraderError {
    /// Timeout, connection reset, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success business code from the exchange.
    #[error("exchange error {code}: {msg}")]
    Protocol { code: String, msg: String },

    /// Business code / message classified as a margin shortfall.
    #[error("insufficient margin {code}: {msg}")]
    MarginInsufficient { code: String, msg: String },

    /// Even the minimum order would need more margin than is usable.
    #[error("sizing rejected: required margin {required:.4} exceeds usable {usable:.4}")]
    SizingRejected { required: f64, usable: f64 },

    /// Decision provider output could not be parsed after the repair pass.
    #[error("decision parse error: {0}")]
    DecisionParse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Coarse classification consumed by the retry dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Margin,
    Rejected,
    Parse,
    Fatal,
}

impl TraderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TraderError::Network(_) | TraderError::Protocol { .. } => ErrorKind::Transient,
            TraderError::MarginInsufficient { .. } => ErrorKind::Margin,
            TraderError::SizingRejected { .. } => ErrorKind::Rejected,
            TraderError::DecisionParse(_) => ErrorKind::Parse,
            TraderError::Storage(_) | TraderError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// Classify an exchange business code + message pair.
    ///
    /// Code `0` is never an error; callers check success before calling this.
    pub fn from_business_code(code: &str, msg: &str) -> Self {
        let lower = msg.to_lowercase();
        if code == MARGIN_INSUFFICIENT_CODE
            || lower.contains("insufficient")
            || lower.contains("margin")
        {
            TraderError::MarginInsufficient { code: code.to_owned(), msg: msg.to_owned() }
        } else {
            TraderError::Protocol { code: code.to_owned(), msg: msg.to_owned() }
        }
    }
}

impl From<reqwest::Error> for TraderError {
    fn from(e: reqwest::Error) -> Self {
        TraderError::Network(e.to_string())
    }
}

impl From<rusqlite::Error> for TraderError {
    fn from(e: rusqlite::Error) -> Self {
        TraderError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for TraderError {
    fn from(e: r2d2::Error) -> Self {
        TraderError::Storage(e.to_string())
    }
}

impl From<polars::prelude::PolarsError> for TraderError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        TraderError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TraderError>;
