//! Shared bus ownership.
//!
//! Every plate on the stack hangs off one SPI device and one set of control
//! lines. [`BusContext`] owns them and hands out serialized access: a
//! transaction holds the bus lock from its acknowledge pre-check until the
//! frame line is released, so clones can be given to any number of board
//! handles, on any number of threads.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::hw_trait::{BusError, BusTransport, Clock, Level, Line};
use crate::protocol::{
    CommandFrame, ProtocolEngine, ReadMode, ResponseBuffer, Timing, TransactionError,
    TransactionPolicy,
};
use crate::tracing::prelude::*;

/// Cloneable handle to the plate bus.
#[derive(Clone)]
pub struct BusContext {
    inner: Arc<Mutex<BusInner>>,
    clock: Arc<dyn Clock>,
    timing: Timing,
}

struct BusInner {
    transport: Box<dyn BusTransport + Send>,
}

impl BusContext {
    /// A transaction takes a few milliseconds; anything waiting this long
    /// for the lock is stuck behind a wedged caller.
    const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Take ownership of a transport and drive the frame line to idle.
    pub fn new<T, C>(transport: T, clock: C, timing: Timing) -> Result<Self>
    where
        T: BusTransport + Send + 'static,
        C: Clock + 'static,
    {
        let mut transport: Box<dyn BusTransport + Send> = Box::new(transport);
        transport.set_line(Line::Frame, Level::Low)?;
        clock.delay_us(timing.frame_settle_us);
        debug!(?timing, "Bus initialised");

        Ok(Self {
            inner: Arc::new(Mutex::new(BusInner { transport })),
            clock: Arc::new(clock),
            timing,
        })
    }

    /// Open the hardware bus described by `config`.
    #[cfg(target_os = "linux")]
    pub fn open(config: &Config) -> Result<Self> {
        let transport = crate::transport::LinuxBus::open(&config.bus)?;
        Self::new(transport, crate::hw_trait::SystemClock::new(), config.timing)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_config: &Config) -> Result<Self> {
        Err(crate::error::Error::Unsupported(
            "hardware bus access requires Linux spidev".into(),
        ))
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// An engine configured with this bus's timing.
    pub fn engine(&self, policy: TransactionPolicy) -> ProtocolEngine {
        ProtocolEngine::new(policy, self.timing)
    }

    /// Run one transaction with exclusive use of the bus.
    pub fn transact(
        &self,
        engine: &ProtocolEngine,
        address: u8,
        frame: CommandFrame,
        mode: ReadMode,
    ) -> ResponseBuffer {
        let Some(mut inner) = self.inner.try_lock_for(Self::LOCK_TIMEOUT) else {
            error!(address, "Bus lock timeout (possible deadlock)");
            return ResponseBuffer::failed(TransactionError::BusUnavailable);
        };
        engine.execute(&mut *inner.transport, &*self.clock, address, frame, mode)
    }

    /// True when some plate is holding the interrupt line low.
    pub fn interrupt_pending(&self) -> Result<bool> {
        let Some(mut inner) = self.inner.try_lock_for(Self::LOCK_TIMEOUT) else {
            error!("Bus lock timeout polling interrupt line");
            return Err(BusError::Unavailable("bus lock timed out".into()).into());
        };
        Ok(inner.transport.read_line(Line::Interrupt)?.is_low())
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}
