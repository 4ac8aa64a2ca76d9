use crate::domain::strategy::{PairParams, StrategyKind};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub kraken_api_key: String,
    pub kraken_api_secret: String,
    pub telegram_token: String,
    /// The one principal the control plane answers to.
    pub allowed_user_id: u64,
    pub poll_interval_sec: u64,
    pub mode: StrategyKind,
    /// Seconds between sampling sessions.
    pub sleeping_interval: u64,
    /// Days of OHLC history backing the ATR.
    pub atr_data_days: i64,
    pub pairs: Vec<String>,
    pub pair_params: HashMap<String, PairParams>,
    pub min_allocation: HashMap<String, Decimal>,
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let kraken_api_key = env::var("KRAKEN_API_KEY").context("KRAKEN_API_KEY is not set")?;
        let kraken_api_secret =
            env::var("KRAKEN_API_SECRET").context("KRAKEN_API_SECRET is not set")?;
        let telegram_token = env::var("TELEGRAM_TOKEN").context("TELEGRAM_TOKEN is not set")?;
        let allowed_user_id = env::var("ALLOWED_USER_ID")
            .context("ALLOWED_USER_ID is not set")?
            .parse::<u64>()
            .context("Failed to parse ALLOWED_USER_ID")?;

        let poll_interval_sec = env::var("POLL_INTERVAL_SEC")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<u64>()
            .context("Failed to parse POLL_INTERVAL_SEC")?;

        let mode_str = env::var("MODE").unwrap_or_else(|_| "rebuy".to_string());
        let mode = StrategyKind::from_str(&mode_str)?;

        let sleeping_interval = env::var("SLEEPING_INTERVAL")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .context("Failed to parse SLEEPING_INTERVAL")?;

        let atr_data_days = env::var("ATR_DATA_DAYS")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<i64>()
            .context("Failed to parse ATR_DATA_DAYS")?;

        let pairs_str = env::var("PAIRS").unwrap_or_else(|_| "XBTEUR".to_string());
        let pairs: Vec<String> = pairs_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if pairs.is_empty() {
            anyhow::bail!("No valid pairs configured");
        }

        let dflt_k_act = decimal_env("K_ACT", "4.5")?;
        let dflt_k_stop_sell = decimal_env("K_STOP_SELL", "2.5")?;
        let dflt_k_stop_buy = decimal_env("K_STOP_BUY", "2.5")?;
        let dflt_min_margin = decimal_env("MIN_MARGIN", "0.01")?;

        let mut pair_params = HashMap::new();
        let mut min_allocation = HashMap::new();
        for pair in &pairs {
            let k_act = decimal_env_override(&format!("K_ACT_{}", pair), dflt_k_act)?;
            let k_stop_sell =
                decimal_env_override(&format!("K_STOP_SELL_{}", pair), dflt_k_stop_sell)?;
            let k_stop_buy =
                decimal_env_override(&format!("K_STOP_BUY_{}", pair), dflt_k_stop_buy)?;
            let min_margin =
                decimal_env_override(&format!("MIN_MARGIN_{}", pair), dflt_min_margin)?;

            let params = PairParams::new(k_act, k_stop_sell, k_stop_buy, min_margin)
                .with_context(|| format!("Invalid trading params for {}", pair))?;
            pair_params.insert(pair.clone(), params);

            min_allocation.insert(
                pair.clone(),
                decimal_env_override(&format!("MIN_ALLOCATION_{}", pair), Decimal::ZERO)?,
            );
        }

        let state_dir = PathBuf::from(env::var("STATE_DIR").unwrap_or_else(|_| "data".to_string()));

        Ok(Config {
            kraken_api_key,
            kraken_api_secret,
            telegram_token,
            allowed_user_id,
            poll_interval_sec,
            mode,
            sleeping_interval,
            atr_data_days,
            pairs,
            pair_params,
            min_allocation,
            state_dir,
        })
    }
}

fn decimal_env(name: &str, default: &str) -> Result<Decimal> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<Decimal>()
        .with_context(|| format!("Failed to parse {}", name))
}

fn decimal_env_override(name: &str, fallback: Decimal) -> Result<Decimal> {
    match env::var(name) {
        Ok(value) => value
            .parse::<Decimal>()
            .with_context(|| format!("Failed to parse {}", name)),
        Err(_) => Ok(fallback),
    }
}
