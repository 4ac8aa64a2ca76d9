//! Session scheduler.
//!
//! One cooperative loop drives everything: each iteration loads the
//! persisted state, samples the market once per pair, feeds fills and the
//! sample to the engine, and persists the result. The loop is the only
//! writer of the position maps and the state document; the control plane
//! only flips the pause flag and reads.

use crate::application::control::PauseFlag;
use crate::application::engine::TrailingEngine;
use crate::domain::ports::{ExchangeService, StateStore};
use crate::domain::position::TrailingState;
use crate::domain::types::{Fill, MarketSample, PairInfo};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Fills are pulled back this far so a restart cannot miss anything.
const INGEST_LOOKBACK_SECS: i64 = 60 * 60 * 24 * 7;

/// Pause between pairs, to stay friendly with exchange rate limits.
const INTER_PAIR_DELAY: Duration = Duration::from_secs(1);

pub struct SessionLoop {
    exchange: Arc<dyn ExchangeService>,
    store: Arc<dyn StateStore>,
    engine: TrailingEngine,
    pairs: Vec<PairInfo>,
    session_interval: Duration,
    pause: PauseFlag,
    shutdown: watch::Receiver<bool>,
}

impl SessionLoop {
    pub fn new(
        exchange: Arc<dyn ExchangeService>,
        store: Arc<dyn StateStore>,
        engine: TrailingEngine,
        pairs: Vec<PairInfo>,
        session_interval: Duration,
        pause: PauseFlag,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            exchange,
            store,
            engine,
            pairs,
            session_interval,
            pause,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Trading loop started: mode={}, pairs={}, interval={}s",
            self.engine.mode(),
            self.pairs.len(),
            self.session_interval.as_secs()
        );

        loop {
            if self.shutdown_requested() {
                break;
            }

            if self.pause.is_paused() {
                info!("Bot is paused. Sleeping...");
                if self.sleep(self.session_interval).await {
                    break;
                }
                continue;
            }

            self.run_session().await;

            if self.sleep(self.session_interval).await {
                break;
            }
        }

        info!("Trading loop stopped.");
    }

    /// One full sampling session across all configured pairs.
    pub async fn run_session(&mut self) {
        info!("======== STARTING SESSION ========");

        let mut state = self.store.load();

        let balance = match self.exchange.balance().await {
            Ok(balance) => balance,
            Err(e) => {
                error!(
                    "Could not fetch balance. Skipping session and retrying in {}s: {:#}",
                    self.session_interval.as_secs(),
                    e
                );
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let week_ago = now - INGEST_LOOKBACK_SECS;
        let two_sessions_ago = now - 2 * self.session_interval.as_secs() as i64;
        let fills = match self
            .exchange
            .closed_orders_between(week_ago, two_sessions_ago)
            .await
        {
            Ok(fills) => fills,
            Err(e) => {
                // The sliding window plus idempotent ingestion make it safe
                // to pick these up next session instead.
                error!("Could not fetch closed orders this session: {:#}", e);
                HashMap::new()
            }
        };

        for pair in self.pairs.clone() {
            if let Err(e) = self.process_pair(&pair, &mut state, &fills, &balance).await {
                error!(
                    "Could not fetch price or ATR for {}. Skipping this pair: {:#}",
                    pair.id, e
                );
            }

            if self.shutdown_requested() || self.sleep(INTER_PAIR_DELAY).await {
                break;
            }
        }

        if let Err(e) = self.store.save(&state) {
            // In-memory mutations die with this scope; the next session
            // reloads the last durable document and recovers from there.
            error!("Failed to persist trailing state: {:#}", e);
        }

        info!(
            "Session complete. Sleeping for {}s.",
            self.session_interval.as_secs()
        );
    }

    async fn process_pair(
        &self,
        pair: &PairInfo,
        state: &mut TrailingState,
        fills: &HashMap<String, Fill>,
        balance: &HashMap<String, Decimal>,
    ) -> Result<()> {
        let price = self
            .exchange
            .last_price(&pair.primary)
            .await
            .with_context(|| format!("last price for {}", pair.id))?;
        let atr = self
            .exchange
            .current_atr(pair)
            .await
            .with_context(|| format!("ATR for {}", pair.id))?;

        match atr {
            Some(atr) => info!("[{}] Market: {} | ATR: {}", pair.id, price, atr),
            None => info!("[{}] Market: {} | ATR unavailable", pair.id, price),
        }

        let pair_state = state.entry(pair.id.clone()).or_default();
        self.engine.ingest_fills(pair, pair_state, fills, atr);
        self.engine
            .tick_positions(
                self.exchange.as_ref(),
                self.store.as_ref(),
                pair,
                pair_state,
                MarketSample { price, atr },
                balance,
            )
            .await;

        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep that wakes early on shutdown. Returns true when shutdown fired.
    async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::control::Notifier;
    use crate::domain::strategy::{PairParams, StrategyKind};
    use crate::domain::types::OrderSide;
    use crate::infrastructure::mock::{MemoryStateStore, MockExchange};
    use rust_decimal_macros::dec;

    fn pair(id: &str, primary: &str) -> PairInfo {
        PairInfo {
            id: id.to_string(),
            primary: primary.to_string(),
            ws_name: format!("{}/EUR", &id[..3]),
            base: "XXBT".to_string(),
            quote: "ZEUR".to_string(),
        }
    }

    fn session(
        exchange: Arc<MockExchange>,
        store: Arc<MemoryStateStore>,
        pairs: Vec<PairInfo>,
    ) -> SessionLoop {
        let params = PairParams::new(dec!(4.5), dec!(2.5), dec!(2.5), dec!(0.01)).unwrap();
        let param_map = pairs
            .iter()
            .map(|p| (p.id.clone(), params.clone()))
            .collect();
        let engine = TrailingEngine::new(
            StrategyKind::Multipliers,
            param_map,
            HashMap::new(),
            Notifier::disabled(),
        );
        let (_tx, rx) = watch::channel(false);
        SessionLoop::new(
            exchange,
            store,
            engine,
            pairs,
            Duration::from_secs(60),
            PauseFlag::new(),
            rx,
        )
    }

    fn recent_fill(pair: &str, price: Decimal) -> Fill {
        Fill {
            pair: pair.to_string(),
            side: OrderSide::Buy,
            price,
            volume: dec!(0.01),
            cost: (price * dec!(0.01)).round_dp(2),
            close_time: chrono::Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn test_balance_failure_skips_whole_session() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(MemoryStateStore::new());
        exchange.set_price("XXBTZEUR", dec!(60000));
        exchange.set_atr("XBTEUR", Some(dec!(300)));
        exchange.add_fill("OID-1", recent_fill("XBTEUR", dec!(60000)));
        exchange.fail_next_balance();

        let mut session = session(
            exchange.clone(),
            store.clone(),
            vec![pair("XBTEUR", "XXBTZEUR")],
        );
        session.run_session().await;

        assert!(store.snapshot().is_empty(), "skipped session must not ingest");
    }

    #[tokio::test]
    async fn test_pair_failure_skips_only_that_pair() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(MemoryStateStore::new());
        exchange.set_balance("ZEUR", dec!(10000));
        // XBTEUR price is scripted to fail; ETHEUR works.
        exchange.set_price("XETHZEUR", dec!(3000));
        exchange.set_atr("ETHEUR", Some(dec!(20)));
        exchange.add_fill("OID-ETH", recent_fill("ETHEUR", dec!(3000)));
        exchange.fail_next_price();

        let mut session = session(
            exchange.clone(),
            store.clone(),
            vec![pair("XBTEUR", "XXBTZEUR"), pair("ETHEUR", "XETHZEUR")],
        );
        session.run_session().await;

        let state = store.snapshot();
        assert!(state.get("XBTEUR").map(|s| s.is_empty()).unwrap_or(true));
        assert_eq!(state["ETHEUR"].len(), 1);
    }

    #[tokio::test]
    async fn test_atr_failure_skips_pair() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(MemoryStateStore::new());
        exchange.set_balance("ZEUR", dec!(10000));
        exchange.set_price("XXBTZEUR", dec!(60000));
        exchange.add_fill("OID-1", recent_fill("XBTEUR", dec!(60000)));
        exchange.fail_next_atr();

        let mut session = session(
            exchange.clone(),
            store.clone(),
            vec![pair("XBTEUR", "XXBTZEUR")],
        );
        session.run_session().await;
        assert!(
            store
                .snapshot()
                .get("XBTEUR")
                .map(|s| s.is_empty())
                .unwrap_or(true)
        );

        // The ATR source recovers; the pair catches up next session.
        exchange.set_atr("XBTEUR", Some(dec!(300)));
        session.run_session().await;
        assert_eq!(store.snapshot()["XBTEUR"].len(), 1);
    }

    #[tokio::test]
    async fn test_session_ingests_and_persists_armed_position() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(MemoryStateStore::new());
        exchange.set_balance("ZEUR", dec!(10000));
        exchange.set_price("XXBTZEUR", dec!(60000));
        exchange.set_atr("XBTEUR", Some(dec!(300)));
        exchange.add_fill("OID-1", recent_fill("XBTEUR", dec!(60000)));

        let mut session = session(
            exchange.clone(),
            store.clone(),
            vec![pair("XBTEUR", "XXBTZEUR")],
        );
        session.run_session().await;

        let state = store.snapshot();
        let pos = &state["XBTEUR"]["OID-1"];
        assert!(pos.is_armed());
        assert_eq!(pos.activation_price, dec!(61350));

        // A second session with the same fills changes nothing.
        session.run_session().await;
        assert_eq!(store.snapshot(), state);
    }

    #[tokio::test]
    async fn test_save_failure_leaves_previous_document_authoritative() {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(MemoryStateStore::new());
        exchange.set_balance("ZEUR", dec!(10000));
        exchange.set_price("XXBTZEUR", dec!(60000));
        exchange.set_atr("XBTEUR", Some(dec!(300)));
        exchange.add_fill("OID-1", recent_fill("XBTEUR", dec!(60000)));
        store.fail_next_save();

        let mut session = session(
            exchange.clone(),
            store.clone(),
            vec![pair("XBTEUR", "XXBTZEUR")],
        );
        session.run_session().await;
        assert!(store.snapshot().is_empty());

        // Next session re-ingests from the durable (empty) document.
        session.run_session().await;
        assert_eq!(store.snapshot()["XBTEUR"].len(), 1);
    }
}
