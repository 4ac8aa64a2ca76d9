//! Scripted port doubles for tests. No live trading system in here: the
//! mock exchange replays whatever prices, ATRs and fills a test sets, and
//! records every order it is asked to place.

use crate::domain::position::{ClosedPosition, TrailingState};
use crate::domain::ports::{ExchangeService, StateStore};
use crate::domain::types::{Fill, OrderSide, PairInfo};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub pair: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Default)]
pub struct MockExchange {
    balances: Mutex<HashMap<String, Decimal>>,
    prices: Mutex<HashMap<String, Decimal>>,
    atrs: Mutex<HashMap<String, Option<Decimal>>>,
    fills: Mutex<HashMap<String, Fill>>,
    placed: Mutex<Vec<PlacedOrder>>,
    cancelled: Mutex<Vec<String>>,
    fail_next_balance: AtomicBool,
    fail_next_price: AtomicBool,
    fail_next_atr: AtomicBool,
    fail_next_place: AtomicBool,
    txid_counter: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(asset.to_string(), amount);
    }

    /// Script the last price for a primary query symbol.
    pub fn set_price(&self, primary_symbol: &str, price: Decimal) {
        self.prices
            .lock()
            .unwrap()
            .insert(primary_symbol.to_string(), price);
    }

    /// Script the ATR for a pair id; `None` models "no usable data".
    pub fn set_atr(&self, pair_id: &str, atr: Option<Decimal>) {
        self.atrs.lock().unwrap().insert(pair_id.to_string(), atr);
    }

    pub fn add_fill(&self, fill_id: &str, fill: Fill) {
        self.fills
            .lock()
            .unwrap()
            .insert(fill_id.to_string(), fill);
    }

    pub fn fail_next_balance(&self) {
        self.fail_next_balance.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_price(&self) {
        self.fail_next_price.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_atr(&self) {
        self.fail_next_atr.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_place_limit(&self) {
        self.fail_next_place.store(true, Ordering::SeqCst);
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeService for MockExchange {
    async fn balance(&self) -> Result<HashMap<String, Decimal>> {
        if self.fail_next_balance.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock: balance unavailable");
        }
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn last_price(&self, primary_symbol: &str) -> Result<Decimal> {
        if self.fail_next_price.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock: price unavailable");
        }
        self.prices
            .lock()
            .unwrap()
            .get(primary_symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("mock: no price scripted for {}", primary_symbol))
    }

    async fn current_atr(&self, pair: &PairInfo) -> Result<Option<Decimal>> {
        if self.fail_next_atr.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock: ATR unavailable");
        }
        Ok(self
            .atrs
            .lock()
            .unwrap()
            .get(&pair.id)
            .copied()
            .flatten())
    }

    async fn closed_orders_between(
        &self,
        _start: i64,
        closed_after: i64,
    ) -> Result<HashMap<String, Fill>> {
        Ok(self
            .fills
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, fill)| fill.close_time >= closed_after)
            .map(|(id, fill)| (id.clone(), fill.clone()))
            .collect())
    }

    async fn place_limit(
        &self,
        pair: &PairInfo,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String> {
        if self.fail_next_place.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock: order rejected");
        }
        self.placed.lock().unwrap().push(PlacedOrder {
            pair: pair.id.clone(),
            side,
            price,
            volume,
        });
        let n = self.txid_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("MOCK-TX-{}", n))
    }

    async fn cancel_order(&self, txid: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(txid.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<TrailingState>,
    closed: Mutex<Vec<ClosedPosition>>,
    fail_next_save: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: TrailingState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    pub fn closed_records(&self) -> Vec<ClosedPosition> {
        self.closed.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> TrailingState {
        self.state.lock().unwrap().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> TrailingState {
        self.state.lock().unwrap().clone()
    }

    fn save(&self, state: &TrailingState) -> Result<()> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            anyhow::bail!("mock: save failed");
        }
        *self.state.lock().unwrap() = state.clone();
        Ok(())
    }

    fn append_closed(&self, record: &ClosedPosition) -> Result<()> {
        self.closed.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> PairInfo {
        PairInfo {
            id: "XBTEUR".to_string(),
            primary: "XXBTZEUR".to_string(),
            ws_name: "XBT/EUR".to_string(),
            base: "XXBT".to_string(),
            quote: "ZEUR".to_string(),
        }
    }

    #[tokio::test]
    async fn test_orders_are_recorded_and_cancellable() {
        let exchange = MockExchange::new();
        let txid = exchange
            .place_limit(&pair(), OrderSide::Sell, dec!(60650), dec!(0.01))
            .await
            .unwrap();
        assert_eq!(exchange.placed_orders().len(), 1);

        exchange.cancel_order(&txid).await.unwrap();
        assert_eq!(exchange.cancelled_orders(), vec![txid]);
    }

    #[tokio::test]
    async fn test_failure_flags_fire_once() {
        let exchange = MockExchange::new();
        exchange.fail_next_balance();
        assert!(exchange.balance().await.is_err());
        assert!(exchange.balance().await.is_ok());
    }
}
