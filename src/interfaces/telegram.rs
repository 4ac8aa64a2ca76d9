//! Telegram control plane.
//!
//! One authorized operator drives the daemon remotely: pause and resume the
//! trading loop, inspect market data and open positions. Messages from any
//! other sender are silently ignored. The dispatcher runs concurrently with
//! the trading loop but never mutates trading state; it flips the shared
//! pause flag and reads the persisted snapshot.

use crate::application::control::PauseFlag;
use crate::domain::ports::{ExchangeService, StateStore};
use crate::domain::position::TrailingPosition;
use crate::domain::strategy::StrategyKind;
use crate::domain::types::{OrderSide, PairInfo};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::ShutdownToken;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::update_listeners::Polling;
use teloxide::utils::command::{BotCommands, ParseError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "Show available commands")]
    Help,
    #[command(description = "Bot status and configured pairs")]
    Status,
    #[command(description = "Pause bot operations")]
    Pause,
    #[command(description = "Resume bot operations")]
    Resume,
    #[command(
        description = "Current market data (all or specific pair)",
        parse_with = optional_pair
    )]
    Market(String),
    #[command(
        description = "Open positions (all or specific pair)",
        parse_with = optional_pair
    )]
    Positions(String),
}

/// `[pair]` arguments are optional; the default parser would reject a bare
/// command.
fn optional_pair(input: String) -> Result<(String,), ParseError> {
    Ok((input.trim().to_string(),))
}

pub struct ControlContext {
    exchange: Arc<dyn ExchangeService>,
    store: Arc<dyn StateStore>,
    pause: PauseFlag,
    pairs: Vec<PairInfo>,
    mode: StrategyKind,
    operator_id: u64,
}

pub struct ControlPlane {
    bot: Bot,
    ctx: Arc<ControlContext>,
    poll_interval: Duration,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: &str,
        operator_id: u64,
        poll_interval_sec: u64,
        exchange: Arc<dyn ExchangeService>,
        store: Arc<dyn StateStore>,
        pause: PauseFlag,
        pairs: Vec<PairInfo>,
        mode: StrategyKind,
    ) -> Self {
        Self {
            bot: Bot::new(token),
            ctx: Arc::new(ControlContext {
                exchange,
                store,
                pause,
                pairs,
                mode,
                operator_id,
            }),
            poll_interval: Duration::from_secs(poll_interval_sec),
        }
    }

    /// Push a message straight to the operator, outside the notification
    /// channel. Used for the startup and shutdown notices.
    pub async fn announce(&self, text: &str) {
        let chat = ChatId(self.ctx.operator_id as i64);
        if let Err(e) = self.bot.send_message(chat, text).await {
            warn!("Failed to send operator announcement: {}", e);
        }
    }

    /// Spawn the command dispatcher and the notification forwarder.
    /// Returns the dispatcher task handle and its shutdown token.
    pub fn start(
        self,
        mut notifications: mpsc::UnboundedReceiver<String>,
    ) -> (JoinHandle<()>, ShutdownToken) {
        let chat = ChatId(self.ctx.operator_id as i64);

        let notifier_bot = self.bot.clone();
        tokio::spawn(async move {
            while let Some(message) = notifications.recv().await {
                if let Err(e) = notifier_bot.send_message(chat, message).await {
                    warn!("Failed to deliver operator notification: {}", e);
                }
            }
        });

        let handler = Update::filter_message()
            .filter_command::<Command>()
            .endpoint(handle_command);

        let listener = Polling::builder(self.bot.clone())
            .timeout(self.poll_interval)
            .build();

        let mut dispatcher = Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![self.ctx])
            .default_handler(|_| async {})
            .build();
        let token = dispatcher.shutdown_token();

        let handle = tokio::spawn(async move {
            info!("Control plane started.");
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("Telegram update listener error"),
                )
                .await;
            info!("Control plane stopped.");
        });

        (handle, token)
    }
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<ControlContext>,
) -> ResponseResult<()> {
    let authorized = msg
        .from
        .as_ref()
        .map(|user| user.id.0 == ctx.operator_id)
        .unwrap_or(false);
    if !authorized {
        return Ok(());
    }

    let reply = match cmd {
        Command::Help => help_text(&ctx),
        Command::Status => status_text(&ctx),
        Command::Pause => {
            if ctx.pause.is_paused() {
                "⚠️ Bot is already paused.".to_string()
            } else {
                ctx.pause.pause();
                "⏸ Bot paused. New operations will not be processed.".to_string()
            }
        }
        Command::Resume => {
            if ctx.pause.is_paused() {
                ctx.pause.resume();
                "▶️ Bot resumed.".to_string()
            } else {
                "⚠️ Bot is already running.".to_string()
            }
        }
        Command::Market(filter) => match market_text(&ctx, filter.trim()).await {
            Ok(text) => text,
            Err(e) => format!("❌ Error fetching market status: {:#}", e),
        },
        Command::Positions(filter) => match positions_text(&ctx, filter.trim()).await {
            Ok(text) => text,
            Err(e) => format!("❌ Error fetching positions: {:#}", e),
        },
    };

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

fn help_text(ctx: &ControlContext) -> String {
    let pairs: Vec<&str> = ctx.pairs.iter().map(|p| p.id.as_str()).collect();
    format!(
        "📋 Available commands:\n\n{}\n\nConfigured pairs: {}\nExample: /market {}",
        Command::descriptions(),
        pairs.join(", "),
        pairs.first().unwrap_or(&"XBTEUR")
    )
}

fn status_text(ctx: &ControlContext) -> String {
    let status = if ctx.pause.is_paused() {
        "⏸ PAUSED"
    } else {
        "▶️ RUNNING"
    };
    let pairs: Vec<&str> = ctx.pairs.iter().map(|p| p.id.as_str()).collect();
    format!(
        "Status: {}\nLast activity: {}\n\nMode: {}\nPairs: {}",
        status,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        ctx.mode.to_string().to_uppercase(),
        pairs.join(", ")
    )
}

/// The pairs a `[pair]` argument selects: all of them when empty, exactly
/// one otherwise. An unknown id is an error listing what exists.
fn select_pairs<'a>(ctx: &'a ControlContext, filter: &str) -> anyhow::Result<Vec<&'a PairInfo>> {
    if filter.is_empty() {
        return Ok(ctx.pairs.iter().collect());
    }

    let wanted = filter.to_uppercase();
    ctx.pairs
        .iter()
        .find(|p| p.id == wanted)
        .map(|p| vec![p])
        .ok_or_else(|| {
            let available: Vec<&str> = ctx.pairs.iter().map(|p| p.id.as_str()).collect();
            anyhow::anyhow!("Unknown pair: {}. Available: {}", wanted, available.join(", "))
        })
}

/// Kraken asset codes carry a legacy class prefix (XXBT, ZEUR); strip it
/// for display.
fn pretty_asset(asset: &str) -> &str {
    if asset.len() == 4 && (asset.starts_with('X') || asset.starts_with('Z')) {
        &asset[1..]
    } else {
        asset
    }
}

async fn market_text(ctx: &ControlContext, filter: &str) -> anyhow::Result<String> {
    let pairs = select_pairs(ctx, filter)?;
    let balance = ctx.exchange.balance().await?;

    let mut market_lines = vec!["📈 Market Status:".to_string()];
    let mut assets_seen: Vec<(String, Decimal, Decimal)> = Vec::new();
    let mut quotes_seen: Vec<String> = Vec::new();

    for (idx, pair) in pairs.iter().enumerate() {
        if idx > 0 {
            // Spread queries out to respect exchange rate limits
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let line = async {
            let price = ctx.exchange.last_price(&pair.primary).await?;
            let atr = ctx.exchange.current_atr(pair).await?;
            anyhow::Ok((price, atr))
        };
        match line.await {
            Ok((price, atr)) => {
                let atr_text = atr
                    .map(|a| a.round_dp(2).normalize().to_string())
                    .unwrap_or_else(|| "n/a".to_string());
                market_lines.push(format!(
                    "{}: {} | ATR(15m): {}",
                    pair.ws_name,
                    price.round_dp(2).normalize(),
                    atr_text
                ));

                let held = balance.get(&pair.base).copied().unwrap_or_default();
                if !assets_seen.iter().any(|(a, _, _)| a == &pair.base) {
                    assets_seen.push((pair.base.clone(), held, price));
                }
                if !quotes_seen.contains(&pair.quote) {
                    quotes_seen.push(pair.quote.clone());
                }
            }
            Err(e) => market_lines.push(format!("{}: ❌ Error: {:#}", pair.id, e)),
        }
    }

    let mut balance_lines = vec![String::new(), "💰 Account Balance:".to_string()];
    let mut total = Decimal::ZERO;
    for quote in &quotes_seen {
        let amount = balance.get(quote).copied().unwrap_or_default();
        balance_lines.push(format!(
            "{}: {}",
            pretty_asset(quote),
            amount.round_dp(2).normalize()
        ));
        total += amount;
    }
    for (asset, amount, price) in &assets_seen {
        let value = amount * price;
        balance_lines.push(format!(
            "{}: {} ({})",
            pretty_asset(asset),
            amount.round_dp(8).normalize(),
            value.round_dp(2).normalize()
        ));
        total += value;
    }
    balance_lines.push(format!("Total: {}", total.round_dp(2).normalize()));

    Ok([market_lines, balance_lines].concat().join("\n"))
}

async fn positions_text(ctx: &ControlContext, filter: &str) -> anyhow::Result<String> {
    let pairs = select_pairs(ctx, filter)?;
    let state = ctx.store.load();

    let mut msg = String::from("📊 Open Positions:\n\n");
    let mut total_positions = 0usize;

    for pair in pairs {
        let Some(pair_state) = state.get(&pair.id) else {
            continue;
        };
        if pair_state.is_empty() {
            continue;
        }

        match ctx.exchange.last_price(&pair.primary).await {
            Ok(price) => {
                msg.push_str(&format!(
                    "━━━ {} (Price: {}) ━━━\n",
                    pair.id,
                    price.round_dp(2).normalize()
                ));
                for (id, pos) in pair_state {
                    total_positions += 1;
                    msg.push_str(&format_position(id, pos));
                    msg.push('\n');
                }
            }
            Err(e) => msg.push_str(&format!("❌ Error fetching {}: {:#}\n\n", pair.id, e)),
        }
    }

    if total_positions == 0 {
        return Ok("ℹ️ No open positions.".to_string());
    }

    // Telegram caps messages at 4096 chars; keep the most recent tail.
    let chars: Vec<char> = msg.chars().collect();
    if chars.len() > 4000 {
        msg = chars[chars.len() - 4000..].iter().collect();
    }
    Ok(msg)
}

fn format_position(id: &str, pos: &TrailingPosition) -> String {
    let mut lines = Vec::new();
    let icon = if pos.is_active() { "⚡ " } else { "" };
    lines.push(format!("{}ID: {}", icon, id));
    lines.push(format!(
        "Side: {} | Entry: {}",
        pos.side,
        pos.entry_price.round_dp(2).normalize()
    ));
    match pos.side {
        OrderSide::Sell => lines.push(format!(
            "Volume: {}",
            pos.volume.round_dp(8).normalize()
        )),
        OrderSide::Buy => lines.push(format!("Cost: {}", pos.cost.round_dp(2).normalize())),
    }
    lines.push(format!(
        "Activation: {}",
        pos.activation_price.round_dp(2).normalize()
    ));

    if let (Some(trailing_price), Some(stop_price)) = (pos.trailing_price, pos.stop_price) {
        let pnl_pct = match pos.side {
            OrderSide::Sell => {
                (stop_price - pos.entry_price) / pos.entry_price * Decimal::ONE_HUNDRED
            }
            OrderSide::Buy => {
                (pos.entry_price - stop_price) / pos.entry_price * Decimal::ONE_HUNDRED
            }
        };
        let pnl_icon = if pnl_pct > Decimal::ZERO { "🟢" } else { "🔴" };
        lines.push(format!(
            "Trailing: {}",
            trailing_price.round_dp(2).normalize()
        ));
        lines.push(format!("Stop: {}", stop_price.round_dp(2).normalize()));
        lines.push(format!("P&L: {} {:+}%", pnl_icon, pnl_pct.round_dp(2)));
    }

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{PairState, TrailingState};
    use crate::infrastructure::mock::{MemoryStateStore, MockExchange};
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

    fn context(exchange: Arc<MockExchange>, store: Arc<MemoryStateStore>) -> ControlContext {
        ControlContext {
            exchange,
            store,
            pause: PauseFlag::new(),
            pairs: vec![pair()],
            mode: StrategyKind::Multipliers,
            operator_id: 42,
        }
    }

    fn armed_position() -> TrailingPosition {
        TrailingPosition {
            mode: StrategyKind::Multipliers,
            created_time: "2026-01-10 09:30:00".to_string(),
            activation_time: None,
            closing_time: None,
            opening_order: vec!["OID-1".to_string()],
            side: OrderSide::Sell,
            entry_price: dec!(60000),
            volume: dec!(0.01),
            cost: dec!(600),
            activation_atr: dec!(300),
            activation_price: dec!(61350),
            stop_atr: None,
            stop_price: None,
            trailing_price: None,
            pnl: None,
        }
    }

    #[test]
    fn test_select_pairs_filters_and_rejects_unknown() {
        let ctx = context(Arc::new(MockExchange::new()), Arc::new(MemoryStateStore::new()));

        assert_eq!(select_pairs(&ctx, "").unwrap().len(), 1);
        assert_eq!(select_pairs(&ctx, "xbteur").unwrap()[0].id, "XBTEUR");

        let err = select_pairs(&ctx, "DOGEEUR").unwrap_err().to_string();
        assert!(err.contains("DOGEEUR"));
        assert!(err.contains("XBTEUR"));
    }

    #[test]
    fn test_pretty_asset_strips_class_prefix() {
        assert_eq!(pretty_asset("XXBT"), "XBT");
        assert_eq!(pretty_asset("ZEUR"), "EUR");
        assert_eq!(pretty_asset("SOL"), "SOL");
        assert_eq!(pretty_asset("XBTEUR"), "XBTEUR");
    }

    #[test]
    fn test_format_position_armed_shows_activation_only() {
        let text = format_position("OID-1", &armed_position());
        assert!(text.contains("ID: OID-1"));
        assert!(text.contains("Side: SELL"));
        assert!(text.contains("Volume: 0.01"));
        assert!(text.contains("Activation: 61350"));
        assert!(!text.contains("Stop:"));
        assert!(!text.contains("⚡"));
    }

    #[test]
    fn test_format_position_active_shows_live_pnl() {
        let mut pos = armed_position();
        pos.trailing_price = Some(dec!(61400));
        pos.stop_price = Some(dec!(60650));
        pos.stop_atr = Some(dec!(300));

        let text = format_position("OID-1", &pos);
        assert!(text.contains("⚡"));
        assert!(text.contains("Trailing: 61400"));
        assert!(text.contains("Stop: 60650"));
        // (60650 - 60000) / 60000 * 100
        assert!(text.contains("P&L: 🟢 +1.08%"));
    }

    #[tokio::test]
    async fn test_positions_text_reads_persisted_snapshot() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XXBTZEUR", dec!(61000));

        let mut pair_state = PairState::new();
        pair_state.insert("OID-1".to_string(), armed_position());
        let mut state = TrailingState::new();
        state.insert("XBTEUR".to_string(), pair_state);
        let store = Arc::new(MemoryStateStore::with_state(state));

        let ctx = context(exchange, store);
        let text = positions_text(&ctx, "").await.unwrap();
        assert!(text.contains("XBTEUR (Price: 61000)"));
        assert!(text.contains("ID: OID-1"));
    }

    #[tokio::test]
    async fn test_positions_text_without_positions() {
        let ctx = context(Arc::new(MockExchange::new()), Arc::new(MemoryStateStore::new()));
        assert_eq!(positions_text(&ctx, "").await.unwrap(), "ℹ️ No open positions.");
    }

    #[tokio::test]
    async fn test_market_text_reports_prices_and_balances() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("XXBTZEUR", dec!(61000));
        exchange.set_atr("XBTEUR", Some(dec!(300)));
        exchange.set_balance("ZEUR", dec!(1000));
        exchange.set_balance("XXBT", dec!(0.5));

        let ctx = context(exchange, Arc::new(MemoryStateStore::new()));
        let text = market_text(&ctx, "").await.unwrap();

        assert!(text.contains("XBT/EUR: 61000 | ATR(15m): 300"));
        assert!(text.contains("EUR: 1000"));
        assert!(text.contains("XBT: 0.5 (30500)"));
        assert!(text.contains("Total: 31500"));
    }
}
