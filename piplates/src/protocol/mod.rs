//! Plate command/response protocol.
//!
//! Commands are fixed four-byte frames; responses are a stream of single
//! bytes read either to a fixed count or up to a NUL terminator. The
//! [`engine`] sequences the frame and acknowledge control lines around each
//! exchange.

pub mod engine;
pub mod frame;
pub mod response;

pub use engine::{ProtocolEngine, ReadMode, Timing, TransactionPolicy, TransactionState};
pub use frame::{opcode, CommandFrame};
pub use response::{ResponseBuffer, TransactionError};
