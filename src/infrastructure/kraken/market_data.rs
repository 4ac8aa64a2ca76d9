//! Market data queries: pair resolution, last price, and the ATR series
//! derived from 15-minute OHLC candles.

use super::common::KrakenClient;
use crate::domain::errors::ExchangeError;
use crate::domain::types::PairInfo;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use ta::Next;
use ta::indicators::AverageTrueRange;
use tracing::{info, warn};

/// ATR granularity in minutes.
const OHLC_INTERVAL_MIN: u32 = 15;

#[derive(Debug, Clone, Copy)]
pub(crate) struct OhlcCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl KrakenClient {
    /// Resolve configured pair ids against the exchange listing. Each entry
    /// records the primary query key plus display and asset aliases, so the
    /// rest of the system can speak logical ids only. An id the exchange
    /// does not know is fatal.
    pub async fn resolve_pairs(&self, ids: &[String]) -> Result<Vec<PairInfo>> {
        #[derive(Debug, Deserialize)]
        struct AssetPairEntry {
            altname: String,
            wsname: Option<String>,
            base: String,
            quote: String,
        }

        let query = [("pair", ids.join(","))];
        let listing: HashMap<String, AssetPairEntry> =
            self.query_public("AssetPairs", &query).await?;

        let mut pairs = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = listing.iter().find(|(primary, info)| {
                *primary == id || info.altname == *id || info.wsname.as_deref() == Some(id)
            });
            let Some((primary, info)) = entry else {
                return Err(ExchangeError::UnknownPair { pair: id.clone() }.into());
            };

            let pair = PairInfo {
                id: id.clone(),
                primary: primary.clone(),
                ws_name: info.wsname.clone().unwrap_or_else(|| info.altname.clone()),
                base: info.base.clone(),
                quote: info.quote.clone(),
            };
            info!(
                "Resolved pair {}: primary={}, base={}, quote={}",
                pair.id, pair.primary, pair.base, pair.quote
            );
            pairs.push(pair);
        }

        Ok(pairs)
    }

    pub(crate) async fn fetch_last_price(&self, primary_symbol: &str) -> Result<Decimal> {
        #[derive(Debug, Deserialize)]
        struct TickerEntry {
            /// Last trade closed: [price, lot volume]
            c: Vec<String>,
        }

        let query = [("pair", primary_symbol.to_string())];
        let result: HashMap<String, TickerEntry> = self.query_public("Ticker", &query).await?;

        let entry = result.values().next().ok_or_else(|| {
            ExchangeError::MalformedResponse {
                reason: format!("Ticker returned no entry for {}", primary_symbol),
            }
        })?;
        let price = entry
            .c
            .first()
            .ok_or_else(|| ExchangeError::MalformedResponse {
                reason: format!("Ticker entry for {} has no last trade", primary_symbol),
            })?
            .parse::<Decimal>()
            .with_context(|| format!("Unparsable last price for {}", primary_symbol))?;

        Ok(price)
    }

    /// Current ATR over 15m candles covering the configured history window.
    /// `Ok(None)` means the series was too short or unusable; the caller's
    /// strategy substitutes its floor.
    pub(crate) async fn fetch_current_atr(&self, pair: &PairInfo) -> Result<Option<Decimal>> {
        let since = chrono::Utc::now().timestamp() - self.atr_data_days * 86_400;
        let query = [
            ("pair", pair.primary.clone()),
            ("interval", OHLC_INTERVAL_MIN.to_string()),
            ("since", since.to_string()),
        ];
        let result: serde_json::Value = self.query_public("OHLC", &query).await?;

        // The result object carries the candle array under the pair key
        // (spelling varies by alias) next to a "last" cursor.
        let rows = result
            .get(&pair.primary)
            .or_else(|| result.get(&pair.id))
            .or_else(|| {
                result
                    .as_object()
                    .and_then(|obj| obj.iter().find(|(k, v)| *k != "last" && v.is_array()))
                    .map(|(_, v)| v)
            })
            .and_then(|v| v.as_array());

        let Some(rows) = rows else {
            warn!("OHLC response for {} carries no candle series", pair.id);
            return Ok(None);
        };

        let candles: Vec<OhlcCandle> = rows.iter().filter_map(parse_candle).collect();
        Ok(atr_from_candles(&candles, self.atr_period))
    }
}

/// A Kraken OHLC row: [time, open, high, low, close, vwap, volume, count],
/// prices as strings. Malformed rows are dropped.
fn parse_candle(row: &serde_json::Value) -> Option<OhlcCandle> {
    let row = row.as_array()?;
    let field = |idx: usize| -> Option<f64> {
        let value = row.get(idx)?;
        value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| value.as_f64())
    };
    Some(OhlcCandle {
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(6)?,
    })
}

pub(crate) fn atr_from_candles(candles: &[OhlcCandle], period: usize) -> Option<Decimal> {
    if candles.len() <= period {
        return None;
    }

    let mut atr = match AverageTrueRange::new(period) {
        Ok(atr) => atr,
        Err(_) => return None,
    };

    let mut latest = None;
    for candle in candles {
        let item = ta::DataItem::builder()
            .open(candle.open)
            .high(candle.high)
            .low(candle.low)
            .close(candle.close)
            .volume(candle.volume)
            .build();
        // Rows that fail OHLC sanity checks (e.g. high < low) are skipped.
        let Ok(item) = item else {
            continue;
        };
        latest = Some(atr.next(&item));
    }

    latest
        .filter(|value| value.is_finite() && *value > 0.0)
        .and_then(Decimal::from_f64)
}
