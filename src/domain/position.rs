//! Trailing position records and the persisted state document.
//!
//! A position is uniquely identified by `(pair, id)` where `id` is the
//! originating exchange fill identifier; the id is the key of the per-pair
//! map, never duplicated inside the record. A position with
//! `trailing_price == None` is Armed (waiting for the market to reach its
//! activation price); once `trailing_price` is present it is Active and its
//! stop follows every favorable price move.

use crate::domain::strategy::StrategyKind;
use crate::domain::types::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display/submission precision: prices and ATR snapshots.
pub const PRICE_DP: u32 = 1;
/// Display/submission precision: quote-asset costs.
pub const COST_DP: u32 = 2;
/// Display/submission precision: base-asset volumes.
pub const VOLUME_DP: u32 = 8;
/// Recorded P&L precision (percent).
pub const PNL_DP: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingPosition {
    /// Strategy that authored this position; frozen at creation.
    pub mode: StrategyKind,
    pub created_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_time: Option<String>,
    /// Fill ids merged into this position, oldest first.
    pub opening_order: Vec<String>,
    /// The side the closing order will execute; inverse of the opening fill.
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub volume: Decimal,
    pub cost: Decimal,
    pub activation_atr: Decimal,
    pub activation_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_atr: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    /// Best price observed since activation (highest for sell, lowest for
    /// buy). Present iff the position is Active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
}

impl TrailingPosition {
    pub fn is_active(&self) -> bool {
        self.trailing_price.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.trailing_price.is_none()
    }
}

/// Per-pair positions, keyed by the originating fill id.
pub type PairState = BTreeMap<String, TrailingPosition>;

/// The full persisted document: pair id -> position id -> position.
pub type TrailingState = BTreeMap<String, PairState>;

/// True iff the fill id has already been folded into any position of the
/// pair. Guards idempotent ingestion across overlapping query windows.
pub fn is_processed(fill_id: &str, pair_state: &PairState) -> bool {
    pair_state
        .values()
        .any(|pos| pos.opening_order.iter().any(|id| id == fill_id))
}

/// One record of the append-only closed-positions log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub pair: String,
    pub id: String,
    pub closing_order: String,
    #[serde(flatten)]
    pub position: TrailingPosition,
}
