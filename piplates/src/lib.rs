//! Driver for Pi-Plates expansion boards.
//!
//! Plates share one SPI device and a set of GPIO control lines. A
//! [`bus::BusContext`] owns those, the [`protocol`] layer turns each
//! command into a framed, acknowledged exchange, and the [`board`] layer
//! exposes each plate model's operations on top.

pub mod board;
pub mod bus;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod protocol;
pub mod tracing;
pub mod transport;

pub use board::{BoardHandle, Daqc2Plate, PinState, Plate, PlateModel, RelayPlate, Revision};
pub use bus::BusContext;
pub use config::Config;
pub use error::{Error, Result};
