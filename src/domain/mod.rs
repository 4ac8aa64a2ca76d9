// Core trading domain
pub mod types;

// Trailing position records and the persisted state document
pub mod position;

// Strategy policies (activation distance, ATR floor, stop distance)
pub mod strategy;

// Port interfaces
pub mod ports;

// Domain-specific error types
pub mod errors;
