use thiserror::Error;

/// Errors surfaced by the exchange adapter beneath the port boundary.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Exchange API error: {}", messages.join("; "))]
    Api { messages: Vec<String> },

    #[error("Malformed exchange response: {reason}")]
    MalformedResponse { reason: String },

    #[error("Unknown pair: {pair}. Not present in the exchange pair listing")]
    UnknownPair { pair: String },
}
