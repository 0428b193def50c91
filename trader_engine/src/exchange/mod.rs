/// exchange/mod.rs — Exchange seam
///
/// The execution engine and cycle runner only see `dyn Exchange`; the
/// signed OKX client is one implementation, test doubles are another.
pub mod client;
pub mod rate_limit;
pub mod signing;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use client::OkxClient;
pub use types::{
    AccountBalance, Candle, Credentials, LotSpec, OrderAck, OrderRequest, OrderSide, Position,
    PositionSide,
};

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent `limit` bars, oldest first.
    async fn fetch_candles(&self, inst_id: &str, bar: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn fetch_instrument(&self, inst_id: &str) -> Result<LotSpec>;

    async fn fetch_balance(&self, ccy: &str) -> Result<AccountBalance>;

    /// `None` when flat.
    async fn fetch_position(&self, inst_id: &str, default_leverage: u32) -> Result<Option<Position>>;

    async fn set_leverage(&self, inst_id: &str, leverage: u32, margin_mode: &str) -> Result<()>;

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderAck>;
}
