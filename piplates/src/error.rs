//! Common error types for piplates.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from the transport and protocol layers.

use thiserror::Error;

use crate::board::PlateModel;
use crate::hw_trait::BusError;
use crate::protocol::TransactionError;

/// Main error type for piplates operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Transport errors outside of a transaction (line setup, device open)
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A transaction completed with an invalid response
    #[error("Transaction failed: {0}")]
    Transaction(#[from] TransactionError),

    /// Pin, channel, or state rejected before any bus activity
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No plate answered at the requested address
    #[error("No {model} plate at address {address}")]
    BoardNotFound { model: PlateModel, address: u8 },

    /// Operation not offered by this plate model
    #[error("{0}")]
    Unsupported(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
