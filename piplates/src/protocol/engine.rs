//! The transaction state machine.
//!
//! One call to [`ProtocolEngine::execute`] runs a complete exchange:
//!
//! ```text
//! Idle -> FrameAsserted -> Transmitted -> AwaitingAck -> Reading
//!      -> FrameDeasserted -> Complete | Failed
//! ```
//!
//! Every exit path, including an aborted frame assertion, releases the frame
//! line before returning. Failures never escape as errors; they are folded
//! into the returned [`ResponseBuffer`], whose validity flag is the only
//! thing a caller should trust.

use serde::{Deserialize, Serialize};
use strum::Display;

use super::frame::CommandFrame;
use super::response::{ResponseBuffer, TransactionError};
use crate::hw_trait::{BusError, BusTransport, Clock, Level, Line};
use crate::tracing::prelude::*;

/// How a plate model sequences its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum TransactionPolicy {
    /// Fixed post-transmit delay, acknowledge line ignored.
    #[default]
    Default,
    /// Warn if acknowledge is still low from the previous transaction, then
    /// poll acknowledge after transmit and again before reading.
    AckAware,
}

/// Response read policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read exactly this many bytes. Zero means the command has no response.
    Count(usize),
    /// Read until a NUL, store it, then read and store one trailing byte.
    Terminated,
}

impl ReadMode {
    pub const NONE: ReadMode = ReadMode::Count(0);

    fn reads(self) -> bool {
        !matches!(self, ReadMode::Count(0))
    }
}

/// Phases of a transaction, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransactionState {
    Idle,
    FrameAsserted,
    Transmitted,
    AwaitingAck,
    Reading,
    FrameDeasserted,
    Complete,
    Failed,
}

/// Timing budgets, all in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Wait after driving the frame line before checking it took effect.
    pub frame_settle_us: u64,
    /// Fixed wait after transmit for plates that do not acknowledge.
    pub post_transmit_us: u64,
    /// Acknowledge poll budget immediately after transmit.
    pub ack_short_us: u64,
    /// Acknowledge poll budget before the first response byte.
    pub ack_long_us: u64,
    /// Per-byte read timeout handed to the transport.
    pub byte_timeout_us: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            frame_settle_us: 1_000,
            post_transmit_us: 70,
            ack_short_us: 50,
            ack_long_us: 80,
            byte_timeout_us: 20,
        }
    }
}

/// Runs single request/response exchanges over a borrowed transport.
///
/// The engine holds no bus state of its own. Serializing calls is the
/// caller's job; see [`crate::bus::BusContext`].
#[derive(Debug, Clone, Copy)]
pub struct ProtocolEngine {
    policy: TransactionPolicy,
    timing: Timing,
}

impl ProtocolEngine {
    pub fn new(policy: TransactionPolicy, timing: Timing) -> Self {
        Self { policy, timing }
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Send `frame` to the plate at `address` and collect its response.
    pub fn execute(
        &self,
        bus: &mut dyn BusTransport,
        clock: &dyn Clock,
        address: u8,
        mut frame: CommandFrame,
        mode: ReadMode,
    ) -> ResponseBuffer {
        if let ReadMode::Count(expected) = mode {
            if expected > ResponseBuffer::CAPACITY {
                warn!(
                    address,
                    expected,
                    capacity = ResponseBuffer::CAPACITY,
                    "Requested response does not fit the buffer"
                );
                return ResponseBuffer::failed(TransactionError::InvalidArgument);
            }
        }

        frame.stamp(address);
        let mut state = TransactionState::Idle;
        let mut response = ResponseBuffer::new();

        if self.policy == TransactionPolicy::AckAware {
            self.precheck_ack(bus, address);
        }

        let outcome = match self.assert_frame(bus, clock) {
            Ok(()) => {
                advance(&mut state, TransactionState::FrameAsserted);
                self.run(bus, clock, &frame, mode, &mut response, &mut state)
            }
            Err(e) => Err(e),
        };

        self.release_frame(bus, clock);
        advance(&mut state, TransactionState::FrameDeasserted);

        match outcome {
            Ok(()) => advance(&mut state, TransactionState::Complete),
            Err(e) => {
                debug!(
                    address,
                    opcode = frame.opcode(),
                    error = %e,
                    received = response.len(),
                    "Transaction failed"
                );
                response.fail(e);
                advance(&mut state, TransactionState::Failed);
            }
        }

        response
    }

    fn run(
        &self,
        bus: &mut dyn BusTransport,
        clock: &dyn Clock,
        frame: &CommandFrame,
        mode: ReadMode,
        response: &mut ResponseBuffer,
        state: &mut TransactionState,
    ) -> Result<(), TransactionError> {
        bus.exchange(frame.as_bytes()).map_err(|e| {
            warn!(frame = %hex::encode(frame.as_bytes()), error = %e, "Command exchange failed");
            match e {
                BusError::Unavailable(_) => TransactionError::BusUnavailable,
                _ => TransactionError::TransmitFailure,
            }
        })?;
        advance(state, TransactionState::Transmitted);
        trace!(frame = %hex::encode(frame.as_bytes()), "Transmitted");

        advance(state, TransactionState::AwaitingAck);
        let acked = match self.policy {
            TransactionPolicy::Default => {
                clock.delay_us(self.timing.post_transmit_us);
                true
            }
            TransactionPolicy::AckAware => {
                self.wait_for_ack(bus, clock, self.timing.ack_short_us)
            }
        };

        if !mode.reads() {
            if !acked {
                warn!(
                    address = frame.destination(),
                    opcode = frame.opcode(),
                    "Command not acknowledged"
                );
                response.note_ack_timeout();
            }
            return Ok(());
        }

        // Only the wait right before reading gates the read loop.
        if self.policy == TransactionPolicy::AckAware {
            if !acked {
                debug!(address = frame.destination(), "Acknowledge late after transmit");
            }
            if !self.wait_for_ack(bus, clock, self.timing.ack_long_us) {
                return Err(TransactionError::AckTimeout);
            }
        }

        advance(state, TransactionState::Reading);
        match mode {
            ReadMode::Count(expected) => self.read_count(bus, expected, response)?,
            ReadMode::Terminated => self.read_terminated(bus, response)?,
        }
        trace!(response = %hex::encode(response.raw()), "Received");
        Ok(())
    }

    fn read_count(
        &self,
        bus: &mut dyn BusTransport,
        expected: usize,
        response: &mut ResponseBuffer,
    ) -> Result<(), TransactionError> {
        for _ in 0..expected {
            let byte = self.read_one(bus, response)?;
            response.push(byte);
        }
        Ok(())
    }

    fn read_terminated(
        &self,
        bus: &mut dyn BusTransport,
        response: &mut ResponseBuffer,
    ) -> Result<(), TransactionError> {
        loop {
            if response.is_full() {
                debug!("Response filled without a terminator");
                return Err(TransactionError::ReadTruncated {
                    received: response.len(),
                });
            }
            let byte = self.read_one(bus, response)?;
            response.push(byte);
            if byte == 0 {
                break;
            }
        }

        // The plate follows the NUL with one more byte.
        if response.is_full() {
            return Err(TransactionError::ReadTruncated {
                received: response.len(),
            });
        }
        let trailer = self.read_one(bus, response)?;
        response.push(trailer);
        Ok(())
    }

    fn read_one(
        &self,
        bus: &mut dyn BusTransport,
        response: &ResponseBuffer,
    ) -> Result<u8, TransactionError> {
        bus.read_byte(self.timing.byte_timeout_us).map_err(|e| {
            debug!(received = response.len(), error = %e, "Byte read failed");
            TransactionError::ReadTruncated {
                received: response.len(),
            }
        })
    }

    fn wait_for_ack(&self, bus: &mut dyn BusTransport, clock: &dyn Clock, budget_us: u64) -> bool {
        let start = clock.now_us();
        loop {
            match bus.read_line(Line::Ack) {
                Ok(Level::Low) => return true,
                Ok(Level::High) => {}
                Err(e) => {
                    warn!(error = %e, "Unable to sample acknowledge line");
                    return false;
                }
            }
            if clock.elapsed_since(start) > budget_us {
                trace!(budget_us, "Acknowledge wait expired");
                return false;
            }
        }
    }

    fn precheck_ack(&self, bus: &mut dyn BusTransport, address: u8) {
        if let Ok(Level::Low) = bus.read_line(Line::Ack) {
            warn!(address, "Acknowledge still low from last transaction");
        }
    }

    fn assert_frame(
        &self,
        bus: &mut dyn BusTransport,
        clock: &dyn Clock,
    ) -> Result<(), TransactionError> {
        let line_error = |e: BusError| match e {
            BusError::Unavailable(_) => TransactionError::BusUnavailable,
            _ => TransactionError::FrameAssertFailure,
        };

        bus.set_line(Line::Frame, Level::High).map_err(|e| {
            error!(error = %e, "Unable to drive frame line");
            line_error(e)
        })?;
        clock.delay_us(self.timing.frame_settle_us);

        match bus.read_line(Line::Frame) {
            Ok(Level::High) => Ok(()),
            Ok(Level::Low) => {
                error!("Unable to enable frame line");
                Err(TransactionError::FrameAssertFailure)
            }
            Err(e) => {
                error!(error = %e, "Unable to read back frame line");
                Err(line_error(e))
            }
        }
    }

    fn release_frame(&self, bus: &mut dyn BusTransport, clock: &dyn Clock) {
        if let Err(e) = bus.set_line(Line::Frame, Level::Low) {
            error!(error = %e, "Unable to release frame line");
            return;
        }
        clock.delay_us(self.timing.frame_settle_us);

        if let Ok(Level::High) = bus.read_line(Line::Frame) {
            error!("Unable to disable frame line");
        }
    }
}

fn advance(state: &mut TransactionState, next: TransactionState) {
    trace!(from = %state, to = %next, "Transaction state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcode;
    use crate::transport::sim::{BusEvent, FakeClock, Fault, SimBus};

    const ADDR: u8 = 0x18;

    fn engine(policy: TransactionPolicy) -> ProtocolEngine {
        ProtocolEngine::new(policy, Timing::default())
    }

    fn run(
        sim: &mut SimBus,
        clock: &FakeClock,
        policy: TransactionPolicy,
        mode: ReadMode,
    ) -> ResponseBuffer {
        engine(policy).execute(sim, clock, ADDR, CommandFrame::bare(opcode::ID), mode)
    }

    #[test]
    fn test_fixed_count_exact() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[1, 2, 3]);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Count(3));
        assert!(response.is_valid());
        assert_eq!(response.data(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_fixed_count_one_short() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[1, 2, 3]);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Count(4));
        assert!(!response.is_valid());
        assert_eq!(response.len(), 3);
        assert_eq!(
            response.error(),
            Some(TransactionError::ReadTruncated { received: 3 })
        );
    }

    #[test]
    fn test_terminator_mode_keeps_trailer() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[0x41, 0x42, 0x00, 0x05, 0x77]);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Terminated);
        assert!(response.is_valid());
        assert_eq!(response.len(), 4);
        assert_eq!(response.data(), Some(&[0x41u8, 0x42, 0x00, 0x05][..]));
    }

    #[test]
    fn test_terminator_mode_missing_trailer() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[0x41, 0x00]);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Terminated);
        assert!(!response.is_valid());
        assert_eq!(response.len(), 2);
    }

    #[test]
    fn test_terminator_mode_never_terminated() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[0x41; 64]);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Terminated);
        assert!(!response.is_valid());
        assert_eq!(response.len(), ResponseBuffer::CAPACITY);
    }

    #[test]
    fn test_destination_is_overwritten() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        let mut frame = CommandFrame::new(opcode::OUTPUT_ON, 3, 0);
        frame.stamp(0xAA);

        engine(TransactionPolicy::Default).execute(&mut sim, &clock, ADDR, frame, ReadMode::NONE);
        assert_eq!(sim.exchanges(), vec![vec![ADDR, opcode::OUTPUT_ON, 3, 0]]);
    }

    #[test]
    fn test_frame_assert_failure_skips_transmit() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.inject(Fault::FrameStuckLow);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Count(1));
        assert_eq!(response.error(), Some(TransactionError::FrameAssertFailure));
        assert!(sim.exchanges().is_empty());
        assert_eq!(sim.frame_asserts(), sim.frame_releases());
    }

    #[test]
    fn test_transmit_failure_releases_frame() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.inject(Fault::ExchangeFails);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Count(1));
        assert_eq!(response.error(), Some(TransactionError::TransmitFailure));
        assert!(response.is_empty());
        assert_eq!(sim.events().last(), Some(&BusEvent::FrameReleased));
    }

    #[test]
    fn test_bus_unavailable() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.inject(Fault::Unavailable);

        let response = run(&mut sim, &clock, TransactionPolicy::Default, ReadMode::Count(1));
        assert_eq!(response.error(), Some(TransactionError::BusUnavailable));
        assert_eq!(sim.frame_asserts(), sim.frame_releases());
    }

    #[test]
    fn test_ack_timeout_skips_reads() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[1, 2]);
        sim.inject(Fault::AckNeverAsserted);

        let start = clock.now_us();
        let response = run(&mut sim, &clock, TransactionPolicy::AckAware, ReadMode::Count(2));
        let elapsed = clock.elapsed_since(start);

        assert_eq!(response.error(), Some(TransactionError::AckTimeout));
        assert_eq!(response.len(), 0);
        assert!(!sim.events().iter().any(|e| matches!(e, BusEvent::ByteRead(_))));

        let timing = Timing::default();
        let budget = 2 * timing.frame_settle_us + timing.ack_short_us + timing.ack_long_us;
        assert!(elapsed <= budget + 16, "blocked for {}us", elapsed);
    }

    #[test]
    fn test_ack_timeout_on_write_is_advisory() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.inject(Fault::AckNeverAsserted);

        let response = run(&mut sim, &clock, TransactionPolicy::AckAware, ReadMode::NONE);
        assert!(response.is_valid());
        assert!(response.ack_timed_out());
    }

    #[test]
    fn test_ack_aware_reads_when_acknowledged() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[0x20]);

        let response = run(&mut sim, &clock, TransactionPolicy::AckAware, ReadMode::Count(1));
        assert_eq!(response.data(), Some(&[0x20u8][..]));
    }

    /// Acknowledge reads low on the first poll after transmit, high afterwards.
    struct AckPulse {
        sim: SimBus,
        polls: usize,
    }

    impl BusTransport for AckPulse {
        fn exchange(&mut self, tx: &[u8]) -> Result<(), BusError> {
            self.polls = 0;
            self.sim.exchange(tx)
        }

        fn read_byte(&mut self, timeout_us: u32) -> Result<u8, BusError> {
            self.sim.read_byte(timeout_us)
        }

        fn set_line(&mut self, line: Line, level: Level) -> Result<(), BusError> {
            self.sim.set_line(line, level)
        }

        fn read_line(&mut self, line: Line) -> Result<Level, BusError> {
            if line != Line::Ack {
                return self.sim.read_line(line);
            }
            self.polls = self.polls.saturating_add(1);
            Ok(if self.polls == 1 { Level::Low } else { Level::High })
        }
    }

    #[test]
    fn test_ack_lost_before_read_skips_reads() {
        let sim = SimBus::new();
        let clock = FakeClock::new();
        sim.queue_bytes(&[0xEE, 0xEE]);
        let mut bus = AckPulse {
            sim: sim.clone(),
            polls: 1,
        };

        let response = engine(TransactionPolicy::AckAware).execute(
            &mut bus,
            &clock,
            ADDR,
            CommandFrame::bare(opcode::ID),
            ReadMode::Count(2),
        );

        assert!(!response.is_valid());
        assert_eq!(response.error(), Some(TransactionError::AckTimeout));
        assert_eq!(response.len(), 0);
        assert_eq!(sim.bytes_read(), 0);
        assert_eq!(sim.frame_asserts(), sim.frame_releases());
    }

    #[test]
    fn test_stale_ack_is_only_a_warning() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        sim.inject(Fault::AckStuckLow);
        sim.queue_bytes(&[0x20]);

        let response = run(&mut sim, &clock, TransactionPolicy::AckAware, ReadMode::Count(1));
        assert!(response.is_valid());
    }

    #[test]
    fn test_oversized_request_rejected_before_io() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();

        let response = run(
            &mut sim,
            &clock,
            TransactionPolicy::Default,
            ReadMode::Count(ResponseBuffer::CAPACITY + 1),
        );
        assert_eq!(response.error(), Some(TransactionError::InvalidArgument));
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_frame_symmetry_across_paths() {
        let mut sim = SimBus::new();
        let clock = FakeClock::new();
        let modes = [ReadMode::NONE, ReadMode::Count(2), ReadMode::Terminated];
        let faults = [
            None,
            Some(Fault::ExchangeFails),
            Some(Fault::AckNeverAsserted),
            Some(Fault::ReadBudget(1)),
        ];

        for fault in faults {
            sim.clear_faults();
            if let Some(fault) = fault {
                sim.inject(fault);
            }
            for mode in modes {
                for policy in [TransactionPolicy::Default, TransactionPolicy::AckAware] {
                    sim.queue_bytes(&[0x41, 0x00, 0x01]);
                    run(&mut sim, &clock, policy, mode);
                    assert_eq!(sim.frame_asserts(), sim.frame_releases());
                }
            }
        }
    }
}
