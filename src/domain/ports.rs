use crate::domain::position::{ClosedPosition, TrailingState};
use crate::domain::types::{Fill, OrderSide, PairInfo};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

// Need async_trait for async functions in traits
#[async_trait]
pub trait ExchangeService: Send + Sync {
    /// Account balances by asset code. Failure skips the whole session.
    async fn balance(&self) -> Result<HashMap<String, Decimal>>;

    /// Last traded price for the pair's primary query symbol.
    async fn last_price(&self, primary_symbol: &str) -> Result<Decimal>;

    /// Current N-period ATR for the pair at 15m granularity. `Ok(None)`
    /// means the source returned no usable data; strategies substitute
    /// their floor. `Err` skips the pair this session.
    async fn current_atr(&self, pair: &PairInfo) -> Result<Option<Decimal>>;

    /// Closed fills whose close time falls at or after `closed_after`,
    /// querying history back to `start`. Keyed by fill id.
    async fn closed_orders_between(
        &self,
        start: i64,
        closed_after: i64,
    ) -> Result<HashMap<String, Fill>>;

    /// Place a limit order; returns the exchange transaction id.
    async fn place_limit(
        &self,
        pair: &PairInfo,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String>;

    async fn cancel_order(&self, txid: &str) -> Result<()>;
}

/// Persistence for the trailing-state document and the closed-positions log.
pub trait StateStore: Send + Sync {
    /// Read the persisted document. Missing or unreadable state is empty,
    /// never an error; the daemon must be able to start from nothing.
    fn load(&self) -> TrailingState;

    /// Atomically rewrite the document. After this returns, a crash loses
    /// no positions.
    fn save(&self, state: &TrailingState) -> Result<()>;

    /// Append one record to the closed-positions log.
    fn append_closed(&self, record: &ClosedPosition) -> Result<()>;
}
