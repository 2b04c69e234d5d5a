//! Hardware abstraction layer traits.
//!
//! This module defines the contract the protocol engine needs from the
//! platform: a full-duplex byte exchange, a single-byte read with a
//! timeout, and digital access to the named control lines that frame a
//! transaction. Implementations live in [`crate::transport`], either real
//! Linux hardware or the in-process simulator.
//!
//! Timing is injected the same way through [`Clock`], so the polling loops
//! in the engine can run against a fake clock in tests.

use std::time::{Duration, Instant};

use strum::{Display, EnumString};
use thiserror::Error;

/// Control lines shared by every plate on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Line {
    /// Driven high by the host for the duration of one transaction.
    Frame,
    /// Pulled low by the addressed plate when it is ready to respond.
    Ack,
    /// Pulled low by any plate with a pending interrupt.
    Interrupt,
}

/// Logic level of a control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Errors reported by a bus transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus device could not be opened or is gone
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// A transfer was attempted and failed
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// No byte arrived within the allotted time
    #[error("timed out")]
    Timeout,

    /// A control line could not be driven or sampled
    #[error("control line {line}: {reason}")]
    Line { line: Line, reason: String },
}

/// Byte-level access to the plate bus.
///
/// Callers must own the transport for the whole duration of a transaction;
/// nothing here arbitrates between concurrent users.
pub trait BusTransport {
    /// Clock `tx` out on the bus, full duplex. Received bytes are discarded.
    fn exchange(&mut self, tx: &[u8]) -> Result<(), BusError>;

    /// Clock in a single byte, giving up after `timeout_us` microseconds.
    fn read_byte(&mut self, timeout_us: u32) -> Result<u8, BusError>;

    /// Drive a control line.
    fn set_line(&mut self, line: Line, level: Level) -> Result<(), BusError>;

    /// Sample a control line.
    fn read_line(&mut self, line: Line) -> Result<Level, BusError>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn exchange(&mut self, tx: &[u8]) -> Result<(), BusError> {
        (**self).exchange(tx)
    }

    fn read_byte(&mut self, timeout_us: u32) -> Result<u8, BusError> {
        (**self).read_byte(timeout_us)
    }

    fn set_line(&mut self, line: Line, level: Level) -> Result<(), BusError> {
        (**self).set_line(line, level)
    }

    fn read_line(&mut self, line: Line) -> Result<Level, BusError> {
        (**self).read_line(line)
    }
}

/// Monotonic microsecond time source used for settle delays and polling
/// deadlines.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary, fixed origin.
    fn now_us(&self) -> u64;

    /// Block the calling thread for at least `us` microseconds.
    fn delay_us(&self, us: u64);

    /// Microseconds elapsed since `start`, a value previously returned by
    /// [`Clock::now_us`].
    fn elapsed_since(&self, start: u64) -> u64 {
        self.now_us().saturating_sub(start)
    }
}

/// Wall-clock implementation of [`Clock`].
///
/// Delays under a millisecond busy-wait; the scheduler cannot be trusted
/// with the tens-of-microseconds budgets the plates expect.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    const SPIN_LIMIT_US: u64 = 1_000;

    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn delay_us(&self, us: u64) {
        if us >= Self::SPIN_LIMIT_US {
            std::thread::sleep(Duration::from_micros(us));
            return;
        }
        let deadline = Instant::now() + Duration::from_micros(us);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}
