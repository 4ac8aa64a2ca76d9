//! Strategy policies.
//!
//! A strategy decides, from an ATR sample and an entry price, how far the
//! market must move before a position starts trailing and how far below the
//! trailing reference its stop sits. Strategies are pure; the engine owns
//! all state. The variant that authored a position is frozen on it as its
//! `mode`, so a configuration change never re-interprets existing positions.
//!
//! Two variants ship:
//! - [`Multipliers`]: symmetric `K_ACT`/`K_STOP` multiples of a floored ATR,
//!   with an explicit minimum-profit clamp on the stop.
//! - [`Rebuy`]: asymmetric per-side multiples of the raw ATR, padded by an
//!   entry-proportional term in the activation distance instead of a clamp.

use crate::domain::types::OrderSide;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-pair strategy parameters, derived once from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PairParams {
    pub k_act: Decimal,
    pub k_stop_sell: Decimal,
    pub k_stop_buy: Decimal,
    /// Mean of the two stop multipliers; the symmetric variant uses this.
    pub k_stop: Decimal,
    pub min_margin_pct: Decimal,
    /// ATR floor as a fraction of price: `min_margin_pct / (k_act - k_stop)`.
    pub atr_min_pct: Decimal,
}

impl PairParams {
    pub fn new(
        k_act: Decimal,
        k_stop_sell: Decimal,
        k_stop_buy: Decimal,
        min_margin_pct: Decimal,
    ) -> anyhow::Result<Self> {
        let k_stop = (k_stop_sell + k_stop_buy) / dec!(2);
        if k_act <= k_stop {
            anyhow::bail!(
                "K_ACT ({}) must exceed the mean K_STOP ({}) for the ATR floor to be defined",
                k_act,
                k_stop
            );
        }
        let atr_min_pct = min_margin_pct / (k_act - k_stop);
        Ok(Self {
            k_act,
            k_stop_sell,
            k_stop_buy,
            k_stop,
            min_margin_pct,
            atr_min_pct,
        })
    }
}

/// Outcome of ingesting a fill: the side the new position will close with,
/// the ATR snapshot it was armed against, and its activation price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillDecision {
    pub side: OrderSide,
    pub atr: Decimal,
    pub activation_price: Decimal,
}

/// The capability set every strategy implements. All operations are pure.
pub trait Strategy: Send + Sync {
    /// ATR sample the strategy works with, after applying its floor.
    /// An absent `current_atr` always substitutes the floor.
    fn atr_value(
        &self,
        entry_price: Decimal,
        current_atr: Option<Decimal>,
        params: &PairParams,
    ) -> Decimal;

    /// Distance from entry to the activation price.
    fn activation_distance(
        &self,
        side: OrderSide,
        atr: Decimal,
        entry_price: Decimal,
        params: &PairParams,
    ) -> Decimal;

    /// Stop price derived from the trailing reference. Implementations that
    /// declare a margin floor clamp here so the stop never crosses
    /// `entry * (1 ± min_margin_pct)`.
    fn stop_price(
        &self,
        side: OrderSide,
        entry_price: Decimal,
        trailing_ref: Decimal,
        atr: Decimal,
        params: &PairParams,
    ) -> Decimal;

    /// Arm a position from an executed fill. The position closes on the
    /// inverse side of the fill; a sell activates above entry, a buy below.
    fn on_fill(
        &self,
        fill_side: OrderSide,
        entry_price: Decimal,
        current_atr: Option<Decimal>,
        params: &PairParams,
    ) -> FillDecision {
        let side = fill_side.inverse();
        let atr = self.atr_value(entry_price, current_atr, params);
        let distance = self.activation_distance(side, atr, entry_price, params);
        let activation_price = match side {
            OrderSide::Sell => entry_price + distance,
            OrderSide::Buy => entry_price - distance,
        };
        FillDecision {
            side,
            atr,
            activation_price,
        }
    }
}

/// Symmetric ATR-multiple strategy with a floored ATR and a minimum-profit
/// clamp on the stop.
pub struct Multipliers;

impl Strategy for Multipliers {
    fn atr_value(
        &self,
        entry_price: Decimal,
        current_atr: Option<Decimal>,
        params: &PairParams,
    ) -> Decimal {
        let floor = entry_price * params.atr_min_pct;
        match current_atr {
            None => floor,
            Some(atr) if atr < floor => floor,
            Some(atr) => atr,
        }
    }

    fn activation_distance(
        &self,
        _side: OrderSide,
        atr: Decimal,
        _entry_price: Decimal,
        params: &PairParams,
    ) -> Decimal {
        params.k_act * atr
    }

    fn stop_price(
        &self,
        side: OrderSide,
        entry_price: Decimal,
        trailing_ref: Decimal,
        atr: Decimal,
        params: &PairParams,
    ) -> Decimal {
        let raw_stop = params.k_stop * atr;
        let min_margin = entry_price * params.min_margin_pct;

        let max_space = match side {
            OrderSide::Sell => (trailing_ref - entry_price) - min_margin,
            OrderSide::Buy => (entry_price - trailing_ref) - min_margin,
        };
        let stop_distance = raw_stop.min(max_space.max(Decimal::ZERO));

        match side {
            OrderSide::Sell => trailing_ref - stop_distance,
            OrderSide::Buy => trailing_ref + stop_distance,
        }
    }
}

/// Asymmetric strategy built for re-entry cycling: raw ATR, per-side stop
/// multipliers, and entry-proportional padding in the activation distance
/// that provides the profit margin implicitly.
pub struct Rebuy;

/// Activation padding above the ATR term, as a fraction of entry price.
const REBUY_SELL_PAD: Decimal = dec!(0.0106);
const REBUY_BUY_PAD: Decimal = dec!(0.001);

impl Strategy for Rebuy {
    fn atr_value(
        &self,
        entry_price: Decimal,
        current_atr: Option<Decimal>,
        params: &PairParams,
    ) -> Decimal {
        match current_atr {
            Some(atr) => atr,
            None => entry_price * params.atr_min_pct,
        }
    }

    fn activation_distance(
        &self,
        side: OrderSide,
        atr: Decimal,
        entry_price: Decimal,
        params: &PairParams,
    ) -> Decimal {
        match side {
            OrderSide::Sell => params.k_stop_sell * atr + REBUY_SELL_PAD * entry_price,
            OrderSide::Buy => params.k_stop_buy * atr + REBUY_BUY_PAD * entry_price,
        }
    }

    fn stop_price(
        &self,
        side: OrderSide,
        _entry_price: Decimal,
        trailing_ref: Decimal,
        atr: Decimal,
        params: &PairParams,
    ) -> Decimal {
        match side {
            OrderSide::Sell => trailing_ref - params.k_stop_sell * atr,
            OrderSide::Buy => trailing_ref + params.k_stop_buy * atr,
        }
    }
}

/// Which strategy authored a position. Serialized into the state document,
/// so variant names are part of the persisted format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Multipliers,
    Rebuy,
}

impl StrategyKind {
    pub fn strategy(self) -> &'static dyn Strategy {
        match self {
            StrategyKind::Multipliers => &Multipliers,
            StrategyKind::Rebuy => &Rebuy,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Multipliers => write!(f, "multipliers"),
            StrategyKind::Rebuy => write!(f, "rebuy"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "multipliers" => Ok(StrategyKind::Multipliers),
            "rebuy" => Ok(StrategyKind::Rebuy),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'multipliers' or 'rebuy'", s),
        }
    }
}
