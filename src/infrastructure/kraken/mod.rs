//! Kraken REST adapter.
//!
//! Everything Kraken-specific lives behind this module: request signing,
//! the error-array envelope, symbol aliases, pagination. The engine only
//! ever sees the [`ExchangeService`] port and logical pair ids.

mod common;
mod execution;
mod market_data;

pub use common::KrakenClient;

use crate::domain::ports::ExchangeService;
use crate::domain::types::{Fill, OrderSide, PairInfo};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[async_trait]
impl ExchangeService for KrakenClient {
    async fn balance(&self) -> Result<HashMap<String, Decimal>> {
        self.fetch_balance().await
    }

    async fn last_price(&self, primary_symbol: &str) -> Result<Decimal> {
        self.fetch_last_price(primary_symbol).await
    }

    async fn current_atr(&self, pair: &PairInfo) -> Result<Option<Decimal>> {
        self.fetch_current_atr(pair).await
    }

    async fn closed_orders_between(
        &self,
        start: i64,
        closed_after: i64,
    ) -> Result<HashMap<String, Fill>> {
        self.fetch_closed_orders(start, closed_after).await
    }

    async fn place_limit(
        &self,
        pair: &PairInfo,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String> {
        self.submit_limit_order(pair, side, price, volume).await
    }

    async fn cancel_order(&self, txid: &str) -> Result<()> {
        self.cancel_order_by_txid(txid).await
    }
}
