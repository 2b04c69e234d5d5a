//! In-process plate simulator.
//!
//! [`SimBus`] implements [`BusTransport`] against a set of [`SimPlate`]s
//! keyed by bus address. Every line change, exchanged frame and byte read is
//! recorded so tests can assert on exactly what crossed the bus, and
//! [`Fault`]s can be injected to exercise the failure paths.
//!
//! Clones share state: keep one clone as a spy after handing the other to a
//! [`crate::bus::BusContext`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::board::PlateModel;
use crate::hw_trait::{BusError, BusTransport, Clock, Level, Line};
use crate::protocol::{opcode, CommandFrame};

/// Something observable that happened on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    FrameAsserted,
    FrameReleased,
    Exchange(Vec<u8>),
    ByteRead(u8),
    ReadFailed,
}

/// Injected misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Driving the frame line high has no effect.
    FrameStuckLow,
    /// Every exchange fails with a transfer error.
    ExchangeFails,
    /// The SPI device is gone; exchanges and reads fail.
    Unavailable,
    /// Plates never pull acknowledge low.
    AckNeverAsserted,
    /// Acknowledge reads low at all times.
    AckStuckLow,
    /// Only this many further byte reads succeed.
    ReadBudget(usize),
}

#[derive(Debug, Default)]
struct Faults {
    frame_stuck_low: bool,
    exchange_fails: bool,
    unavailable: bool,
    ack_never: bool,
    ack_stuck_low: bool,
    read_budget: Option<usize>,
}

#[derive(Debug, Default)]
struct SimState {
    plates: BTreeMap<u8, SimPlate>,
    frame_high: bool,
    acked: bool,
    pending: VecDeque<u8>,
    events: Vec<BusEvent>,
    faults: Faults,
}

/// Simulated bus with any number of plates attached.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small stack for running the binaries without hardware: one DAQC2
    /// and one relay plate, both in slot 0.
    pub fn stack() -> Self {
        let mut daqc2 = SimPlate::daqc2(0);
        for (channel, raw) in daqc2.adc.iter_mut().enumerate() {
            *raw = SimPlate::ADC_MIDSCALE + 0x0800 * channel as u16;
        }
        Self::new().with_plate(daqc2).with_plate(SimPlate::relay(0))
    }

    /// Builder form of [`SimBus::add_plate`].
    pub fn with_plate(self, plate: SimPlate) -> Self {
        self.add_plate(plate);
        self
    }

    pub fn add_plate(&self, plate: SimPlate) {
        self.state.lock().plates.insert(plate.address, plate);
    }

    pub fn remove_plate(&self, address: u8) -> Option<SimPlate> {
        self.state.lock().plates.remove(&address)
    }

    /// Snapshot of the plate at `address`.
    pub fn plate(&self, address: u8) -> Option<SimPlate> {
        self.state.lock().plates.get(&address).cloned()
    }

    /// Mutate the plate at `address` in place, e.g. to drive its inputs.
    pub fn with_plate_mut<R>(&self, address: u8, f: impl FnOnce(&mut SimPlate) -> R) -> Option<R> {
        self.state.lock().plates.get_mut(&address).map(f)
    }

    /// Seed raw response bytes. The next exchange is acknowledged even if
    /// no plate answers it, so protocol tests need no plate at all.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.state.lock().pending.extend(bytes.iter().copied());
    }

    pub fn inject(&self, fault: Fault) {
        let mut state = self.state.lock();
        let faults = &mut state.faults;
        match fault {
            Fault::FrameStuckLow => faults.frame_stuck_low = true,
            Fault::ExchangeFails => faults.exchange_fails = true,
            Fault::Unavailable => faults.unavailable = true,
            Fault::AckNeverAsserted => faults.ack_never = true,
            Fault::AckStuckLow => faults.ack_stuck_low = true,
            Fault::ReadBudget(n) => faults.read_budget = Some(n),
        }
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Every frame clocked out, in order.
    pub fn exchanges(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                BusEvent::Exchange(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn frame_asserts(&self) -> usize {
        self.count(|e| matches!(e, BusEvent::FrameAsserted))
    }

    pub fn frame_releases(&self) -> usize {
        self.count(|e| matches!(e, BusEvent::FrameReleased))
    }

    pub fn bytes_read(&self) -> usize {
        self.count(|e| matches!(e, BusEvent::ByteRead(_)))
    }

    fn count(&self, pred: impl Fn(&BusEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }
}

impl BusTransport for SimBus {
    fn exchange(&mut self, tx: &[u8]) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.faults.unavailable {
            return Err(BusError::Unavailable("simulated device removed".into()));
        }
        if state.faults.exchange_fails {
            return Err(BusError::Transfer("simulated transfer error".into()));
        }
        state.events.push(BusEvent::Exchange(tx.to_vec()));

        // Plates only listen while the frame line is high.
        if !state.frame_high {
            return Ok(());
        }

        let answered = match tx {
            &[address, op, arg1, arg2] => state
                .plates
                .get_mut(&address)
                .map(|plate| plate.respond(CommandFrame::new(op, arg1, arg2))),
            _ => None,
        };
        match answered {
            Some(bytes) => {
                state.pending.extend(bytes);
                state.acked = true;
            }
            None => state.acked = !state.pending.is_empty(),
        }
        Ok(())
    }

    fn read_byte(&mut self, _timeout_us: u32) -> Result<u8, BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.faults.unavailable {
            return Err(BusError::Unavailable("simulated device removed".into()));
        }
        if let Some(budget) = state.faults.read_budget.as_mut() {
            if *budget == 0 {
                state.events.push(BusEvent::ReadFailed);
                return Err(BusError::Timeout);
            }
            *budget -= 1;
        }
        match state.pending.pop_front() {
            Some(byte) => {
                state.events.push(BusEvent::ByteRead(byte));
                Ok(byte)
            }
            None => {
                state.events.push(BusEvent::ReadFailed);
                Err(BusError::Timeout)
            }
        }
    }

    fn set_line(&mut self, line: Line, level: Level) -> Result<(), BusError> {
        let mut state = self.state.lock();
        match (line, level) {
            (Line::Frame, Level::High) => {
                state.events.push(BusEvent::FrameAsserted);
                state.frame_high = !state.faults.frame_stuck_low;
                Ok(())
            }
            (Line::Frame, Level::Low) => {
                state.events.push(BusEvent::FrameReleased);
                state.frame_high = false;
                state.acked = false;
                state.pending.clear();
                Ok(())
            }
            (line, _) => Err(BusError::Line {
                line,
                reason: "input only".into(),
            }),
        }
    }

    fn read_line(&mut self, line: Line) -> Result<Level, BusError> {
        let state = self.state.lock();
        let level = match line {
            Line::Frame => Level::from(state.frame_high),
            Line::Ack => {
                let low = state.faults.ack_stuck_low || (state.acked && !state.faults.ack_never);
                Level::from(!low)
            }
            Line::Interrupt => {
                let pending = state.plates.values().any(SimPlate::interrupt_asserted);
                Level::from(!pending)
            }
        };
        Ok(level)
    }
}

/// Firmware model of one plate.
///
/// Fields are public so tests can stage inputs and inspect outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPlate {
    pub model: PlateModel,
    pub address: u8,
    /// Answer to the address query, if different from `address`.
    pub reported_address: Option<u8>,
    pub id: String,
    pub hw_revision: u8,
    pub fw_revision: u8,
    pub outputs: u8,
    pub inputs: u8,
    pub leds: u8,
    pub adc: [u16; 9],
    pub dac: [u16; 4],
    pub calibration: [u8; 48],
    pub irq_enabled: bool,
    pub irq_rising: u8,
    pub irq_falling: u8,
    pub irq_flags: u16,
    pub resets: usize,
}

impl SimPlate {
    /// ADC code for 0 V on a bipolar channel.
    pub const ADC_MIDSCALE: u16 = 0x8000;

    fn new(model: PlateModel, index: u8, id: &str, hw: u8, fw: u8) -> Self {
        Self {
            model,
            address: model.address(index),
            reported_address: None,
            id: id.to_string(),
            hw_revision: hw,
            fw_revision: fw,
            outputs: 0,
            inputs: 0,
            leds: 0,
            adc: [Self::ADC_MIDSCALE; 9],
            dac: [0; 4],
            calibration: [0; 48],
            irq_enabled: false,
            irq_rising: 0,
            irq_falling: 0,
            irq_flags: 0,
            resets: 0,
        }
    }

    pub fn relay(index: u8) -> Self {
        Self::new(PlateModel::Relay, index, "Pi-Plate RELAY", 0x10, 0x15)
    }

    pub fn daqc2(index: u8) -> Self {
        Self::new(PlateModel::Daqc2, index, "Pi-Plate DAQC2", 0x10, 0x12)
    }

    pub fn with_calibration(mut self, table: [u8; 48]) -> Self {
        self.calibration = table;
        self
    }

    /// Drive a digital input, latching an interrupt flag if that edge is
    /// armed.
    pub fn set_input(&mut self, pin: u8, high: bool) {
        let mask = 1u8 << pin;
        let was_high = self.inputs & mask != 0;
        if high {
            self.inputs |= mask;
        } else {
            self.inputs &= !mask;
        }
        let rose = high && !was_high && self.irq_rising & mask != 0;
        let fell = !high && was_high && self.irq_falling & mask != 0;
        if rose || fell {
            self.irq_flags |= u16::from(mask);
        }
    }

    pub fn interrupt_asserted(&self) -> bool {
        self.irq_enabled && self.irq_flags != 0
    }

    fn respond(&mut self, frame: CommandFrame) -> Vec<u8> {
        let op = frame.opcode();
        let mut payload = match op {
            opcode::ADDRESS => vec![self.reported_address.unwrap_or(self.address)],
            opcode::ID => {
                let mut bytes = self.id.clone().into_bytes();
                bytes.push(0);
                bytes
            }
            opcode::HW_REVISION => vec![self.hw_revision],
            opcode::FW_REVISION => vec![self.fw_revision],
            opcode::RESET => {
                self.reset();
                vec![]
            }
            _ => match self.model {
                PlateModel::Relay => self.relay_command(frame),
                PlateModel::Daqc2 => self.daqc2_command(frame),
            },
        };

        match self.model {
            PlateModel::Relay if op == opcode::ID => payload.push(self.id.len() as u8),
            PlateModel::Daqc2 if !payload.is_empty() => {
                let sum = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                payload.push(!sum);
            }
            _ => {}
        }
        payload
    }

    fn reset(&mut self) {
        self.outputs = 0;
        self.leds = 0;
        self.dac = [0; 4];
        self.irq_enabled = false;
        self.irq_rising = 0;
        self.irq_falling = 0;
        self.irq_flags = 0;
        self.resets += 1;
    }

    fn relay_command(&mut self, frame: CommandFrame) -> Vec<u8> {
        let (arg1, _) = frame.args();
        let relay_bit = |n: u8| (1..=7).contains(&n).then(|| 1u8 << (n - 1));
        match frame.opcode() {
            opcode::OUTPUT_ON => {
                self.outputs |= relay_bit(arg1).unwrap_or(0);
                vec![]
            }
            opcode::OUTPUT_OFF => {
                self.outputs &= !relay_bit(arg1).unwrap_or(0);
                vec![]
            }
            opcode::OUTPUT_TOGGLE => {
                self.outputs ^= relay_bit(arg1).unwrap_or(0);
                vec![]
            }
            opcode::OUTPUT_ALL => {
                self.outputs = arg1 & 0x7F;
                vec![]
            }
            opcode::OUTPUT_STATE => vec![self.outputs],
            opcode::LED_SET | opcode::LED_CLEAR | opcode::LED_TOGGLE if arg1 < 2 => {
                let mask = 1u8 << arg1;
                match frame.opcode() {
                    opcode::LED_SET => self.leds |= mask,
                    opcode::LED_CLEAR => self.leds &= !mask,
                    _ => self.leds ^= mask,
                }
                vec![]
            }
            opcode::LED_STATE if arg1 < 2 => vec![(self.leds >> arg1) & 1],
            _ => vec![],
        }
    }

    fn daqc2_command(&mut self, frame: CommandFrame) -> Vec<u8> {
        let (arg1, arg2) = frame.args();
        let bit = |n: u8| if n < 8 { 1u8 << n } else { 0 };
        match frame.opcode() {
            opcode::OUTPUT_ON => {
                self.outputs |= bit(arg1);
                vec![]
            }
            opcode::OUTPUT_OFF => {
                self.outputs &= !bit(arg1);
                vec![]
            }
            opcode::OUTPUT_TOGGLE => {
                self.outputs ^= bit(arg1);
                vec![]
            }
            opcode::OUTPUT_ALL => {
                self.outputs = arg1;
                vec![]
            }
            opcode::OUTPUT_STATE => vec![self.outputs],
            opcode::DIN_BIT => vec![(self.inputs & bit(arg1) != 0) as u8],
            opcode::DIN_ALL => vec![self.inputs],
            opcode::DIN_IRQ_FALLING => {
                self.irq_falling |= bit(arg1);
                vec![]
            }
            opcode::DIN_IRQ_RISING => {
                self.irq_rising |= bit(arg1);
                vec![]
            }
            opcode::DIN_IRQ_BOTH => {
                self.irq_falling |= bit(arg1);
                self.irq_rising |= bit(arg1);
                vec![]
            }
            opcode::DIN_IRQ_DISABLE => {
                self.irq_falling &= !bit(arg1);
                self.irq_rising &= !bit(arg1);
                vec![]
            }
            opcode::INT_ENABLE => {
                self.irq_enabled = true;
                vec![]
            }
            opcode::INT_DISABLE => {
                self.irq_enabled = false;
                vec![]
            }
            opcode::INT_FLAGS => {
                let flags = std::mem::take(&mut self.irq_flags);
                flags.to_be_bytes().to_vec()
            }
            opcode::ADC_SINGLE => match self.adc.get(arg1 as usize) {
                Some(raw) => raw.to_be_bytes().to_vec(),
                None => vec![],
            },
            opcode::ADC_ALL => self.adc[..8]
                .iter()
                .flat_map(|raw| raw.to_be_bytes())
                .collect(),
            op if (opcode::DAC_BASE..opcode::DAC_BASE + 4).contains(&op) => {
                self.dac[(op - opcode::DAC_BASE) as usize] = u16::from_be_bytes([arg1, arg2]);
                vec![]
            }
            opcode::LED_SET => {
                self.leds = arg1 & 0x07;
                vec![]
            }
            opcode::LED_STATE => vec![self.leds],
            opcode::CALIBRATION if arg1 == 2 => {
                vec![self.calibration.get(arg2 as usize).copied().unwrap_or(0xFF)]
            }
            _ => vec![],
        }
    }
}

/// Deterministic [`Clock`] for tests.
///
/// Every `now_us` call advances time by one microsecond so polling loops
/// terminate; `delay_us` advances by the full amount without sleeping.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    const TICK_US: u64 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Current time without advancing it.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now.fetch_add(Self::TICK_US, Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}
