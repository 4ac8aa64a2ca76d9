//! File-backed persistence for the trailing-state document and the
//! closed-positions log.
//!
//! The document is rewritten through a temp file and an atomic rename, so
//! a crash mid-save leaves the previous version intact and readers never
//! observe a torn file. The closed log is JSON lines, append-only.

use crate::domain::position::{ClosedPosition, TrailingState};
use crate::domain::ports::StateStore;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

const STATE_FILE: &str = "trailing_state.json";
const CLOSED_LOG_FILE: &str = "closed_positions.jsonl";

pub struct FileStateStore {
    state_path: PathBuf,
    closed_log_path: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory {:?}", dir))?;

        Ok(Self {
            state_path: dir.join(STATE_FILE),
            closed_log_path: dir.join(CLOSED_LOG_FILE),
        })
    }

    pub fn state_path(&self) -> &std::path::Path {
        &self.state_path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> TrailingState {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return TrailingState::new();
            }
            Err(e) => {
                error!(
                    "Could not read trailing state {:?}, starting empty: {}",
                    self.state_path, e
                );
                return TrailingState::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                error!(
                    "Corrupt trailing state {:?}, starting empty: {}",
                    self.state_path, e
                );
                TrailingState::new()
            }
        }
    }

    fn save(&self, state: &TrailingState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize trailing state")?;

        // Atomic replace: write to a temp file in the same directory, then
        // rename over the target.
        let temp_path = self.state_path.with_extension("tmp");
        fs::write(&temp_path, content).context("Failed to write temp state file")?;
        fs::rename(&temp_path, &self.state_path).context("Failed to replace state file")?;

        Ok(())
    }

    fn append_closed(&self, record: &ClosedPosition) -> Result<()> {
        let line =
            serde_json::to_string(record).context("Failed to serialize closed position")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.closed_log_path)
            .with_context(|| format!("Failed to open closed log {:?}", self.closed_log_path))?;
        writeln!(file, "{}", line).context("Failed to append to closed log")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{PairState, TrailingPosition};
    use crate::domain::strategy::StrategyKind;
    use crate::domain::types::OrderSide;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_store() -> (FileStateStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "krakentrail-state-test-{}-{}",
            std::process::id(),
            DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        (FileStateStore::new(&dir).unwrap(), dir)
    }

    fn sample_state() -> TrailingState {
        let position = TrailingPosition {
            mode: StrategyKind::Multipliers,
            created_time: "2026-01-10 09:30:00".to_string(),
            activation_time: Some("2026-01-10 11:00:00".to_string()),
            closing_time: None,
            opening_order: vec!["OABC-123".to_string(), "ODEF-456".to_string()],
            side: OrderSide::Sell,
            entry_price: dec!(60000),
            volume: dec!(0.03),
            cost: dec!(1800),
            activation_atr: dec!(300),
            activation_price: dec!(61350),
            stop_atr: Some(dec!(300)),
            stop_price: Some(dec!(60650)),
            trailing_price: Some(dec!(61400)),
            pnl: None,
        };

        let mut pair_state = PairState::new();
        pair_state.insert("OABC-123".to_string(), position);
        let mut state = TrailingState::new();
        state.insert("XBTEUR".to_string(), pair_state);
        state
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (store, dir) = temp_store();
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(store.load(), state);

        // Saving again replaces, never appends
        store.save(&state).unwrap();
        assert_eq!(store.load(), state);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let (store, dir) = temp_store();
        assert!(store.load().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let (store, dir) = temp_store();
        fs::write(store.state_path(), "{not json").unwrap();
        assert!(store.load().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_closed_log_appends_one_line_per_record() {
        let (store, dir) = temp_store();
        let state = sample_state();
        let position = state["XBTEUR"]["OABC-123"].clone();

        let record = ClosedPosition {
            pair: "XBTEUR".to_string(),
            id: "OABC-123".to_string(),
            closing_order: "OCLOSE-1".to_string(),
            position,
        };
        store.append_closed(&record).unwrap();
        store.append_closed(&record).unwrap();

        let content = fs::read_to_string(dir.join(CLOSED_LOG_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: ClosedPosition = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(
            parsed.position.opening_order,
            vec!["OABC-123".to_string(), "ODEF-456".to_string()]
        );

        let _ = fs::remove_dir_all(dir);
    }
}
