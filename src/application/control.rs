//! Runtime state shared between the trading loop and the control plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Pause switch: written by the control plane, read by the trading loop at
/// the top of each session. A paused loop keeps sleeping without touching
/// the exchange or the state document.
#[derive(Clone, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fire-and-forget operator notifications. Sending never blocks the trading
/// loop; if the receiving side is gone the message is dropped.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier with no transport attached; messages go nowhere.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(message.into());
        }
    }
}
