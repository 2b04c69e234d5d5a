//! Plate handles.
//!
//! A [`BoardHandle`] binds one plate address to the shared bus and builds
//! every plate operation out of a single protocol transaction. The
//! model-specific wrappers, [`RelayPlate`] and [`Daqc2Plate`], add the
//! commands only their firmware understands; the [`Plate`] trait gives
//! callers the identity and digital I/O operations common to both.

use std::ops::RangeInclusive;

use serde::Serialize;
use strum::{Display, EnumIter, EnumString};

use crate::bus::BusContext;
use crate::error::{Error, Result};
use crate::protocol::{
    opcode, CommandFrame, ProtocolEngine, ReadMode, ResponseBuffer, TransactionPolicy,
};
use crate::tracing::prelude::*;

pub mod calibration;
pub mod daqc2;
pub mod relay;
pub mod scan;

pub use calibration::{CalibrationTable, ChannelCalibration};
pub use daqc2::{Daqc2Plate, IrqFlags, LedColor};
pub use relay::RelayPlate;
pub use scan::{scan, scan_all};

/// Returned by [`BoardHandle::get_id`] when the plate did not answer.
pub const ID_UNAVAILABLE: &str = "Not Valid Request";

/// Supported plate models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PlateModel {
    Relay,
    Daqc2,
}

impl PlateModel {
    /// Plates of one model share a bus in slots 0 through 7.
    pub const MAX_PLATES: u8 = 8;

    /// Bus address of slot 0.
    pub fn base_address(self) -> u8 {
        match self {
            PlateModel::Relay => 24,
            PlateModel::Daqc2 => 32,
        }
    }

    /// Bus address of the plate in slot `index`.
    pub fn address(self, index: u8) -> u8 {
        self.base_address() + index
    }

    pub fn policy(self) -> TransactionPolicy {
        match self {
            PlateModel::Relay => TransactionPolicy::Default,
            PlateModel::Daqc2 => TransactionPolicy::AckAware,
        }
    }

    /// Valid digital pin numbers. Pin 0 does not exist on the relay plate.
    pub fn pins(self) -> RangeInclusive<i32> {
        match self {
            PlateModel::Relay => 1..=7,
            PlateModel::Daqc2 => 0..=7,
        }
    }

    /// Bytes the firmware appends after every non-empty fixed-length
    /// response. They are read and kept but not interpreted.
    pub fn trailer_len(self) -> usize {
        match self {
            PlateModel::Relay => 0,
            PlateModel::Daqc2 => 1,
        }
    }
}

/// Requested digital output state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PinState {
    Off,
    On,
    Toggle,
}

impl PinState {
    fn opcode(self) -> u8 {
        match self {
            PinState::On => opcode::OUTPUT_ON,
            PinState::Off => opcode::OUTPUT_OFF,
            PinState::Toggle => opcode::OUTPUT_TOGGLE,
        }
    }
}

impl TryFrom<i32> for PinState {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PinState::Off),
            1 => Ok(PinState::On),
            2 => Ok(PinState::Toggle),
            other => Err(Error::InvalidArgument(format!(
                "unsupported pin state {}",
                other
            ))),
        }
    }
}

/// Digital input edge that raises an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Edge {
    Falling,
    Rising,
    Both,
}

impl Edge {
    fn opcode(self) -> u8 {
        match self {
            Edge::Falling => opcode::DIN_IRQ_FALLING,
            Edge::Rising => opcode::DIN_IRQ_RISING,
            Edge::Both => opcode::DIN_IRQ_BOTH,
        }
    }
}

/// Hardware or firmware revision, reported as one BCD-style byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
}

impl Revision {
    /// Placeholder for a plate that did not answer.
    pub const UNKNOWN: Revision = Revision { major: 0, minor: 0 };

    /// `0x12` reads as revision 1.2.
    pub fn from_bcd(byte: u8) -> Self {
        Self {
            major: byte >> 4,
            minor: byte & 0x0F,
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity summary of one plate.
#[derive(Debug, Clone, Serialize)]
pub struct PlateInfo {
    pub model: PlateModel,
    pub index: u8,
    pub address: u8,
    pub id: String,
    pub hw_revision: String,
    pub fw_revision: String,
}

/// One plate on the shared bus.
pub struct BoardHandle {
    bus: BusContext,
    model: PlateModel,
    index: u8,
    engine: ProtocolEngine,
    reported: Option<u8>,
}

impl BoardHandle {
    /// Bind slot `index` of `model`. No bus traffic happens here.
    pub fn new(bus: BusContext, model: PlateModel, index: u8) -> Result<Self> {
        if index >= PlateModel::MAX_PLATES {
            return Err(Error::InvalidArgument(format!(
                "plate index {} out of range 0..{}",
                index,
                PlateModel::MAX_PLATES
            )));
        }
        let engine = bus.engine(model.policy());
        Ok(Self {
            bus,
            model,
            index,
            engine,
            reported: None,
        })
    }

    pub fn model(&self) -> PlateModel {
        self.model
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// The bus address this handle expects the plate to report.
    pub fn address(&self) -> u8 {
        self.model.address(self.index)
    }

    /// The address returned by the most recent [`BoardHandle::validate`],
    /// if that exchange succeeded.
    pub fn reported_address(&self) -> Option<u8> {
        self.reported
    }

    pub fn bus(&self) -> &BusContext {
        &self.bus
    }

    /// Run one raw transaction against this plate.
    pub fn command(&self, frame: CommandFrame, mode: ReadMode) -> ResponseBuffer {
        self.bus.transact(&self.engine, self.address(), frame, mode)
    }

    /// Run a command with no response payload.
    pub(crate) fn send(&self, frame: CommandFrame) -> Result<()> {
        self.command(frame, ReadMode::NONE).into_result()?;
        Ok(())
    }

    /// Run a command returning exactly `N` payload bytes.
    pub(crate) fn query<const N: usize>(&self, frame: CommandFrame) -> Result<[u8; N]> {
        let trailer = self.model.trailer_len();
        let response = self
            .command(frame, ReadMode::Count(N + trailer))
            .into_result()?;

        let raw = response.raw();
        let mut payload = [0u8; N];
        payload.copy_from_slice(&raw[..N]);
        if trailer > 0 {
            trace!(
                address = self.address(),
                opcode = frame.opcode(),
                trailer = %hex::encode(&raw[N..]),
                "Response trailer"
            );
        }
        Ok(payload)
    }

    /// Ask the plate for its address and compare it with the expected one.
    ///
    /// Always performs a transaction; nothing is cached between calls.
    pub fn validate(&mut self) -> bool {
        match self.query::<1>(CommandFrame::bare(opcode::ADDRESS)) {
            Ok([reported]) => {
                self.reported = Some(reported);
                let valid = reported == self.address();
                debug!(
                    model = %self.model,
                    expected = self.address(),
                    reported,
                    valid,
                    "Validated plate"
                );
                valid
            }
            Err(e) => {
                self.reported = None;
                debug!(model = %self.model, address = self.address(), error = %e, "No plate");
                false
            }
        }
    }

    /// Identity string, or [`ID_UNAVAILABLE`] if the plate did not answer.
    pub fn get_id(&self) -> String {
        let response = self.command(CommandFrame::bare(opcode::ID), ReadMode::Terminated);
        match response.data() {
            Some(bytes) => {
                let text = bytes.split(|&b| b == 0).next().unwrap_or_default();
                String::from_utf8_lossy(text).into_owned()
            }
            None => ID_UNAVAILABLE.to_string(),
        }
    }

    pub fn hw_revision(&self) -> Revision {
        self.revision(opcode::HW_REVISION)
    }

    pub fn fw_revision(&self) -> Revision {
        self.revision(opcode::FW_REVISION)
    }

    fn revision(&self, op: u8) -> Revision {
        match self.query::<1>(CommandFrame::bare(op)) {
            Ok([byte]) => Revision::from_bcd(byte),
            Err(e) => {
                debug!(address = self.address(), error = %e, "Revision unavailable");
                Revision::UNKNOWN
            }
        }
    }

    /// Return the plate to its power-on state.
    pub fn reset(&self) -> Result<()> {
        info!(model = %self.model, address = self.address(), "Resetting plate");
        self.send(CommandFrame::bare(opcode::RESET))
    }

    pub(crate) fn check_pin(&self, pin: i32) -> Result<u8> {
        if self.model.pins().contains(&pin) {
            Ok(pin as u8)
        } else {
            Err(Error::InvalidArgument(format!(
                "pin {} out of range {:?} for {} plate",
                pin,
                self.model.pins(),
                self.model
            )))
        }
    }

    /// Drive a digital output. Returns the state that was applied.
    pub fn set_digital_pin(&self, pin: i32, state: PinState) -> Result<PinState> {
        let pin = self.check_pin(pin)?;
        self.send(CommandFrame::new(state.opcode(), pin, 0))?;
        debug!(address = self.address(), pin, %state, "Set digital pin");
        Ok(state)
    }

    /// Read one digital pin.
    ///
    /// The DAQC2 reports an input bit; the relay plate reports its relay
    /// state byte, of which this returns the pin's bit.
    pub fn get_digital_pin(&self, pin: i32) -> Result<bool> {
        let pin = self.check_pin(pin)?;
        match self.model {
            PlateModel::Relay => {
                let [state] = self.query::<1>(CommandFrame::bare(opcode::OUTPUT_STATE))?;
                Ok(state & (1 << (pin - 1)) != 0)
            }
            PlateModel::Daqc2 => {
                let [bit] = self.query::<1>(CommandFrame::new(opcode::DIN_BIT, pin, 0))?;
                Ok(bit != 0)
            }
        }
    }

    /// Read all digital pins as one byte.
    pub fn get_all_digital_pins(&self) -> Result<u8> {
        let op = match self.model {
            PlateModel::Relay => opcode::OUTPUT_STATE,
            PlateModel::Daqc2 => opcode::DIN_ALL,
        };
        let [byte] = self.query::<1>(CommandFrame::bare(op))?;
        Ok(byte)
    }

    /// Collect identity information for display.
    pub fn info(&self) -> PlateInfo {
        PlateInfo {
            model: self.model,
            index: self.index,
            address: self.address(),
            id: self.get_id(),
            hw_revision: self.hw_revision().to_string(),
            fw_revision: self.fw_revision().to_string(),
        }
    }
}

impl std::fmt::Debug for BoardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardHandle")
            .field("model", &self.model)
            .field("index", &self.index)
            .field("address", &self.address())
            .field("reported", &self.reported)
            .finish()
    }
}

/// Operations every plate model supports.
pub trait Plate {
    fn handle(&self) -> &BoardHandle;
    fn handle_mut(&mut self) -> &mut BoardHandle;

    fn validate(&mut self) -> bool {
        self.handle_mut().validate()
    }

    fn id(&self) -> String {
        self.handle().get_id()
    }

    fn hw_revision(&self) -> Revision {
        self.handle().hw_revision()
    }

    fn fw_revision(&self) -> Revision {
        self.handle().fw_revision()
    }

    fn reset(&self) -> Result<()> {
        self.handle().reset()
    }

    fn info(&self) -> PlateInfo {
        self.handle().info()
    }
}

/// Bind a handle and confirm the plate answers at its address.
pub(crate) fn open_handle(bus: BusContext, model: PlateModel, index: u8) -> Result<BoardHandle> {
    let mut handle = BoardHandle::new(bus, model, index)?;
    if !handle.validate() {
        return Err(Error::BoardNotFound {
            model,
            address: handle.address(),
        });
    }
    Ok(handle)
}
