pub mod kraken;
pub mod mock;
pub mod state;
