//! Private (authenticated) operations: balances, closed-order history and
//! order placement.

use super::common::KrakenClient;
use crate::domain::errors::ExchangeError;
use crate::domain::position::{PRICE_DP, VOLUME_DP};
use crate::domain::types::{Fill, OrderSide, PairInfo};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct OrderDescription {
    pair: String,
    #[serde(rename = "type")]
    side: String,
}

#[derive(Debug, Deserialize)]
struct ClosedOrder {
    status: String,
    #[serde(default)]
    closetm: f64,
    price: String,
    vol_exec: String,
    cost: String,
    descr: OrderDescription,
}

#[derive(Debug, Deserialize)]
struct ClosedOrdersPage {
    closed: HashMap<String, ClosedOrder>,
    #[serde(default)]
    count: i64,
}

impl KrakenClient {
    pub(crate) async fn fetch_balance(&self) -> Result<HashMap<String, Decimal>> {
        let raw: HashMap<String, String> = self.query_private("Balance", &[]).await?;

        let mut balance = HashMap::with_capacity(raw.len());
        for (asset, amount) in raw {
            let amount = amount
                .parse::<Decimal>()
                .with_context(|| format!("Unparsable balance for {}", asset))?;
            balance.insert(asset, amount);
        }
        Ok(balance)
    }

    /// Closed orders with a close time at or after `closed_after`, paging
    /// through history starting at `start`. Non-closed and malformed
    /// entries are dropped.
    pub(crate) async fn fetch_closed_orders(
        &self,
        start: i64,
        closed_after: i64,
    ) -> Result<HashMap<String, Fill>> {
        let mut fills = HashMap::new();
        let mut offset = 0usize;

        loop {
            let params = [
                ("start", start.to_string()),
                ("ofs", offset.to_string()),
            ];
            let page: ClosedOrdersPage = self.query_private("ClosedOrders", &params).await?;
            let page_len = page.closed.len();

            for (txid, order) in page.closed {
                if order.status != "closed" {
                    continue;
                }
                let close_time = order.closetm as i64;
                if close_time < closed_after {
                    continue;
                }
                let Ok(side) = order.descr.side.parse::<OrderSide>() else {
                    // Conditional order types surface here too; not ours.
                    continue;
                };
                let parsed = (
                    order.price.parse::<Decimal>(),
                    order.vol_exec.parse::<Decimal>(),
                    order.cost.parse::<Decimal>(),
                );
                let (Ok(price), Ok(volume), Ok(cost)) = parsed else {
                    warn!("Dropping closed order {} with unparsable amounts", txid);
                    continue;
                };

                fills.insert(
                    txid,
                    Fill {
                        pair: order.descr.pair,
                        side,
                        price,
                        volume,
                        cost,
                        close_time,
                    },
                );
            }

            offset += page_len;
            if page_len == 0 || offset as i64 >= page.count {
                break;
            }
        }

        Ok(fills)
    }

    pub(crate) async fn submit_limit_order(
        &self,
        pair: &PairInfo,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String> {
        #[derive(Debug, Deserialize)]
        struct AddOrderResult {
            #[serde(default)]
            txid: Vec<String>,
        }

        let side_param = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let price = price.round_dp(PRICE_DP);
        let volume = volume.round_dp(VOLUME_DP);

        let params = [
            ("pair", pair.primary.clone()),
            ("type", side_param.to_string()),
            ("ordertype", "limit".to_string()),
            ("price", price.to_string()),
            ("volume", volume.to_string()),
        ];
        let result: AddOrderResult = self.query_private("AddOrder", &params).await?;

        let txid = result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::MalformedResponse {
                reason: "AddOrder accepted but returned no transaction id".to_string(),
            })?;

        info!(
            "Created LIMIT {} order {} | {} {} @ {}",
            side, txid, volume, pair.base, price
        );
        Ok(txid)
    }

    pub(crate) async fn cancel_order_by_txid(&self, txid: &str) -> Result<()> {
        let params = [("txid", txid.to_string())];
        let _: serde_json::Value = self.query_private("CancelOrder", &params).await?;
        info!("Cancelled order {}", txid);
        Ok(())
    }
}
