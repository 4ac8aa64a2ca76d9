//! Trailing position engine.
//!
//! Consumes closed exchange fills and per-tick `(price, ATR)` samples and
//! drives every position through Armed -> Active -> Closed:
//!
//! - Ingestion turns each unseen fill into a freshly Armed position on the
//!   inverse side, or merges it into a nearby Armed sibling so a burst of
//!   partial fills does not fragment into competing positions.
//! - A tick first recalibrates prices against ATR drift, then checks the
//!   stop trigger, then follows a favorable price move with the trailing
//!   reference. That order is part of the contract.
//! - While Active the stop only ever moves in the position's favor (up for
//!   sell, down for buy); an unfavorable recalibration candidate is
//!   discarded.
//! - A sell close first passes the inventory-allocation guard; a vetoed
//!   trigger is left unconsumed and re-evaluated next tick.
//! - The closing limit order executes at the stop price. At most one
//!   closing order is ever placed per position: the record leaves the
//!   active map in the same step that accepts the order.

use crate::application::control::Notifier;
use crate::domain::position::{
    COST_DP, ClosedPosition, PNL_DP, PRICE_DP, PairState, TrailingPosition, VOLUME_DP,
    is_processed,
};
use crate::domain::ports::{ExchangeService, StateStore};
use crate::domain::strategy::{PairParams, StrategyKind};
use crate::domain::types::{Fill, MarketSample, OrderSide, PairInfo};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// ATR drift band: a snapshot is refreshed only when the fresh sample lands
/// outside [0.8, 1.2] times the recorded value.
const ATR_BAND_LOWER: Decimal = dec!(0.8);
const ATR_BAND_UPPER: Decimal = dec!(1.2);

/// Entry-price proximity (fraction) within which an unseen fill merges into
/// an existing Armed position instead of creating a new one.
const MERGE_PROXIMITY: Decimal = dec!(0.01);

enum TickOutcome {
    Hold,
    Close,
}

pub struct TrailingEngine {
    mode: StrategyKind,
    params: HashMap<String, PairParams>,
    min_allocation: HashMap<String, Decimal>,
    notifier: Notifier,
}

impl TrailingEngine {
    pub fn new(
        mode: StrategyKind,
        params: HashMap<String, PairParams>,
        min_allocation: HashMap<String, Decimal>,
        notifier: Notifier,
    ) -> Self {
        Self {
            mode,
            params,
            min_allocation,
            notifier,
        }
    }

    pub fn mode(&self) -> StrategyKind {
        self.mode
    }

    /// Fold newly closed fills into the pair's positions. Already-processed
    /// fill ids are skipped, so overlapping query windows are harmless.
    pub fn ingest_fills(
        &self,
        pair: &PairInfo,
        state: &mut PairState,
        fills: &HashMap<String, Fill>,
        current_atr: Option<Decimal>,
    ) {
        let Some(params) = self.params.get(&pair.id) else {
            return;
        };

        // Oldest first so a burst of partial fills merges deterministically.
        let mut ordered: Vec<(&String, &Fill)> = fills
            .iter()
            .filter(|(_, fill)| fill.pair == pair.id)
            .collect();
        ordered.sort_by(|a, b| (a.1.close_time, a.0).cmp(&(b.1.close_time, b.0)));

        for (fill_id, fill) in ordered {
            if is_processed(fill_id, state) {
                continue;
            }
            info!("TrailingEngine [{}]: Processing fill {}", pair.id, fill_id);
            self.arm_position(pair, state, fill_id, fill, current_atr, params);
        }
    }

    fn arm_position(
        &self,
        pair: &PairInfo,
        state: &mut PairState,
        fill_id: &str,
        fill: &Fill,
        current_atr: Option<Decimal>,
        params: &PairParams,
    ) {
        let strategy = self.mode.strategy();
        let decision = strategy.on_fill(fill.side, fill.price, current_atr, params);

        let sibling = state.iter_mut().find(|(_, pos)| {
            pos.mode == self.mode
                && pos.side == decision.side
                && pos.is_armed()
                && ((pos.entry_price - fill.price).abs() / pos.entry_price) <= MERGE_PROXIMITY
        });

        if let Some((sibling_id, pos)) = sibling {
            // Aggregate into the sibling; its entry and activation prices
            // stay untouched.
            let (new_volume, new_cost) = match decision.side {
                OrderSide::Sell => {
                    let volume = pos.volume + fill.volume;
                    (volume, volume * pos.entry_price)
                }
                OrderSide::Buy => {
                    let cost = pos.cost + fill.cost;
                    (cost / pos.entry_price, cost)
                }
            };
            pos.volume = new_volume.round_dp(VOLUME_DP);
            pos.cost = new_cost.round_dp(COST_DP);
            pos.opening_order.push(fill_id.to_string());

            info!(
                "TrailingEngine [{}]: Merged fill {} into position {} (volume={}, cost={})",
                pair.id, fill_id, sibling_id, pos.volume, pos.cost
            );
            self.notifier.notify(format!(
                "🔀 [MERGE] {}: fill {} folded into position {} | activation at {}",
                pair.id, fill_id, sibling_id, pos.activation_price
            ));
            return;
        }

        let position = TrailingPosition {
            mode: self.mode,
            created_time: now_str(),
            activation_time: None,
            closing_time: None,
            opening_order: vec![fill_id.to_string()],
            side: decision.side,
            entry_price: fill.price,
            volume: fill.volume,
            cost: fill.cost.round_dp(COST_DP),
            activation_atr: decision.atr.round_dp(PRICE_DP),
            activation_price: decision.activation_price.round_dp(PRICE_DP),
            stop_atr: None,
            stop_price: None,
            trailing_price: None,
            pnl: None,
        };

        info!(
            "TrailingEngine [{}]: New {} position {} armed, activation at {}",
            pair.id, position.side, fill_id, position.activation_price
        );
        self.notifier.notify(format!(
            "🆕 [CREATE] {}: new trailing position {} for {} | activation at {}",
            pair.id, fill_id, position.side, position.activation_price
        ));
        state.insert(fill_id.to_string(), position);
    }

    /// Advance every position of the pair one tick against a single market
    /// sample. Positions whose stop triggered (and passed the guard) are
    /// closed and removed before the loop moves on.
    pub async fn tick_positions(
        &self,
        exchange: &dyn ExchangeService,
        store: &dyn StateStore,
        pair: &PairInfo,
        state: &mut PairState,
        sample: MarketSample,
        balance: &HashMap<String, Decimal>,
    ) {
        let Some(params) = self.params.get(&pair.id) else {
            return;
        };

        let ids: Vec<String> = state.keys().cloned().collect();
        for id in ids {
            let Some(pos) = state.get_mut(&id) else {
                continue;
            };
            match self.tick_one(pair, &id, pos, sample, balance, params) {
                TickOutcome::Hold => {}
                TickOutcome::Close => {
                    self.close_position(exchange, store, pair, state, &id).await;
                }
            }
        }
    }

    fn tick_one(
        &self,
        pair: &PairInfo,
        id: &str,
        pos: &mut TrailingPosition,
        sample: MarketSample,
        balance: &HashMap<String, Decimal>,
        params: &PairParams,
    ) -> TickOutcome {
        // Recalibration and the stop both dispatch on the strategy that
        // authored the position, not on the currently configured mode.
        let strategy = pos.mode.strategy();
        let atr_now = strategy.atr_value(pos.entry_price, sample.atr, params);

        let (Some(trailing_price), Some(stop_price), Some(stop_atr)) =
            (pos.trailing_price, pos.stop_price, pos.stop_atr)
        else {
            self.tick_armed(pair, id, pos, sample, atr_now, strategy, params);
            return TickOutcome::Hold;
        };

        // Stop-ATR recalibration, favorable candidates only. The locals
        // track what is persisted so the rest of the tick works from the
        // refreshed snapshot.
        let mut stop_price = stop_price;
        let mut stop_atr = stop_atr;
        if outside_band(atr_now, stop_atr) {
            let candidate = strategy
                .stop_price(pos.side, pos.entry_price, trailing_price, atr_now, params)
                .round_dp(PRICE_DP);
            if favorable(pos.side, candidate, stop_price) {
                info!(
                    "TrailingEngine [{}]: Position {} stop recalibrated to {} (ATR {})",
                    pair.id, id, candidate, atr_now
                );
                stop_price = candidate;
                stop_atr = atr_now.round_dp(PRICE_DP);
                pos.stop_price = Some(stop_price);
                pos.stop_atr = Some(stop_atr);
            }
        }

        // Stop trigger.
        let triggered = match pos.side {
            OrderSide::Sell => sample.price <= stop_price,
            OrderSide::Buy => sample.price >= stop_price,
        };
        if triggered {
            let permitted = match pos.side {
                OrderSide::Sell => {
                    self.can_execute_sell(pair, id, pos.volume, balance, sample.price)
                }
                OrderSide::Buy => true,
            };
            if permitted {
                return TickOutcome::Close;
            }
            // Vetoed: nothing is consumed; the trigger is re-evaluated next
            // tick with a fresh price.
            return TickOutcome::Hold;
        }

        // Trailing update on a favorable move.
        let improved = match pos.side {
            OrderSide::Sell => sample.price > trailing_price,
            OrderSide::Buy => sample.price < trailing_price,
        };
        if improved {
            let candidate = strategy
                .stop_price(pos.side, pos.entry_price, sample.price, stop_atr, params)
                .round_dp(PRICE_DP);
            pos.trailing_price = Some(sample.price);
            if favorable(pos.side, candidate, stop_price) {
                pos.stop_price = Some(candidate);
            }
            info!(
                "TrailingEngine [{}]: Position {} trailing at {} | stop {}",
                pair.id,
                id,
                sample.price,
                pos.stop_price.unwrap_or(stop_price)
            );
        }

        TickOutcome::Hold
    }

    fn tick_armed(
        &self,
        pair: &PairInfo,
        id: &str,
        pos: &mut TrailingPosition,
        sample: MarketSample,
        atr_now: Decimal,
        strategy: &dyn crate::domain::strategy::Strategy,
        params: &PairParams,
    ) {
        // Activation-ATR recalibration.
        if outside_band(atr_now, pos.activation_atr) {
            let distance = strategy.activation_distance(pos.side, atr_now, pos.entry_price, params);
            let activation = match pos.side {
                OrderSide::Sell => pos.entry_price + distance,
                OrderSide::Buy => pos.entry_price - distance,
            };
            pos.activation_price = activation.round_dp(PRICE_DP);
            pos.activation_atr = atr_now.round_dp(PRICE_DP);
            info!(
                "TrailingEngine [{}]: Position {} activation recalibrated to {} (ATR {})",
                pair.id, id, pos.activation_price, pos.activation_atr
            );
        }

        // Armed -> Active transition.
        let reached = match pos.side {
            OrderSide::Sell => sample.price >= pos.activation_price,
            OrderSide::Buy => sample.price <= pos.activation_price,
        };
        if reached {
            pos.activation_time = Some(now_str());
            pos.stop_atr = Some(pos.activation_atr);
            pos.trailing_price = Some(sample.price);
            let stop = strategy
                .stop_price(
                    pos.side,
                    pos.entry_price,
                    sample.price,
                    pos.activation_atr,
                    params,
                )
                .round_dp(PRICE_DP);
            pos.stop_price = Some(stop);

            info!(
                "TrailingEngine [{}]: Position {} ACTIVE at {} | stop {}",
                pair.id, id, sample.price, stop
            );
            self.notifier.notify(format!(
                "⚡ [ACTIVE] {}: activation price {} reached for position {}",
                pair.id, pos.activation_price, id
            ));
        }
    }

    /// Inventory-allocation guard for sell closes: the sell must not push
    /// the base asset's share of (base + quote) value below the configured
    /// floor, valued at the current price.
    fn can_execute_sell(
        &self,
        pair: &PairInfo,
        id: &str,
        volume: Decimal,
        balance: &HashMap<String, Decimal>,
        price: Decimal,
    ) -> bool {
        let min_allocation = self
            .min_allocation
            .get(&pair.id)
            .copied()
            .unwrap_or(Decimal::ZERO);

        let base_after = balance.get(&pair.base).copied().unwrap_or_default() - volume;
        let quote_after = balance.get(&pair.quote).copied().unwrap_or_default() + volume * price;

        let total_after = base_after * price + quote_after;
        if total_after.is_zero() {
            return true;
        }

        let allocation_after = (base_after * price) / total_after;
        if allocation_after < min_allocation {
            warn!(
                "TrailingEngine [{}]: Sell {} blocked by inventory ratio: {:.2}% < min {:.0}%",
                pair.id,
                id,
                allocation_after * dec!(100),
                min_allocation * dec!(100)
            );
            self.notifier.notify(format!(
                "🛡 [BLOCKED] {}: sell {} vetoed, allocation after would be {:.2}% < {:.0}%",
                pair.id,
                id,
                allocation_after * dec!(100),
                min_allocation * dec!(100)
            ));
            return false;
        }

        true
    }

    /// Place the closing limit order at the stop price. Quantities execute
    /// at the stop, not at the tick's market price. On success the position
    /// is appended to the closed log and removed; on failure it stays put
    /// and retries next tick.
    async fn close_position(
        &self,
        exchange: &dyn ExchangeService,
        store: &dyn StateStore,
        pair: &PairInfo,
        state: &mut PairState,
        id: &str,
    ) {
        let Some(pos) = state.get_mut(id) else {
            return;
        };
        let Some(stop_price) = pos.stop_price else {
            return;
        };

        let (volume, cost, pnl) = match pos.side {
            OrderSide::Sell => {
                let cost = pos.volume * stop_price;
                let pnl = (stop_price - pos.entry_price) / pos.entry_price * dec!(100);
                (pos.volume, cost, pnl)
            }
            OrderSide::Buy => {
                let volume = pos.cost / stop_price;
                let pnl = (pos.entry_price - stop_price) / pos.entry_price * dec!(100);
                (volume, pos.cost, pnl)
            }
        };
        let volume = volume.round_dp(VOLUME_DP);

        info!(
            "TrailingEngine [{}]: Stop price {} hit for position {}: placing LIMIT {} order",
            pair.id, stop_price, id, pos.side
        );
        self.notifier.notify(format!(
            "⛔ [CLOSE] {}: stop price {} hit for position {}: placing LIMIT {} order",
            pair.id, stop_price, id, pos.side
        ));

        match exchange.place_limit(pair, pos.side, stop_price, volume).await {
            Ok(closing_order) => {
                pos.volume = volume;
                pos.cost = cost.round_dp(COST_DP);
                pos.closing_time = Some(now_str());
                pos.pnl = Some(pnl.round_dp(PNL_DP));

                let record = ClosedPosition {
                    pair: pair.id.clone(),
                    id: id.to_string(),
                    closing_order,
                    position: pos.clone(),
                };
                if let Err(e) = store.append_closed(&record) {
                    error!(
                        "TrailingEngine [{}]: Failed to append position {} to the closed log: {:#}",
                        pair.id, id, e
                    );
                }

                state.remove(id);
                info!(
                    "TrailingEngine [{}]: Position {} closed and removed ({:+}%)",
                    pair.id, id, record.position.pnl.unwrap_or_default()
                );
                self.notifier.notify(format!(
                    "💸 [PNL] {}: position {} closed at {:+}%",
                    pair.id,
                    id,
                    record.position.pnl.unwrap_or_default()
                ));
            }
            Err(e) => {
                error!(
                    "TrailingEngine [{}]: Failed to place closing order for position {}: {:#}",
                    pair.id, id, e
                );
                self.notifier.notify(format!(
                    "❌ {}: failed to place closing order for position {}, retrying next tick",
                    pair.id, id
                ));
            }
        }
    }
}

fn outside_band(atr_now: Decimal, snapshot: Decimal) -> bool {
    atr_now < snapshot * ATR_BAND_LOWER || atr_now > snapshot * ATR_BAND_UPPER
}

/// True when the candidate stop improves on the current one: higher for a
/// sell, lower for a buy.
fn favorable(side: OrderSide, candidate: Decimal, current: Decimal) -> bool {
    match side {
        OrderSide::Sell => candidate > current,
        OrderSide::Buy => candidate < current,
    }
}

fn now_str() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
