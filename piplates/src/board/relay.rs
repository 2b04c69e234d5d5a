//! RELAYplate: seven relays and a status LED.

use super::{open_handle, BoardHandle, PinState, Plate, PlateModel};
use crate::bus::BusContext;
use crate::error::{Error, Result};
use crate::protocol::{opcode, CommandFrame};
use crate::tracing::prelude::*;

#[derive(Debug)]
pub struct RelayPlate {
    handle: BoardHandle,
}

impl RelayPlate {
    /// Highest mask accepted by [`RelayPlate::set_all`].
    pub const ALL_RELAYS: u8 = 0x7F;
    pub const LEDS: u8 = 2;

    pub fn new(bus: BusContext, index: u8) -> Result<Self> {
        Ok(Self {
            handle: BoardHandle::new(bus, PlateModel::Relay, index)?,
        })
    }

    /// Like [`RelayPlate::new`], but fails if no relay plate answers.
    pub fn open(bus: BusContext, index: u8) -> Result<Self> {
        Ok(Self {
            handle: open_handle(bus, PlateModel::Relay, index)?,
        })
    }

    pub fn relay_on(&self, relay: i32) -> Result<()> {
        self.handle.set_digital_pin(relay, PinState::On).map(drop)
    }

    pub fn relay_off(&self, relay: i32) -> Result<()> {
        self.handle.set_digital_pin(relay, PinState::Off).map(drop)
    }

    pub fn relay_toggle(&self, relay: i32) -> Result<()> {
        self.handle.set_digital_pin(relay, PinState::Toggle).map(drop)
    }

    pub fn relay(&self, relay: i32) -> Result<bool> {
        self.handle.get_digital_pin(relay)
    }

    /// Set every relay at once. Bit 0 drives relay 1.
    pub fn set_all(&self, mask: u8) -> Result<()> {
        if mask > Self::ALL_RELAYS {
            return Err(Error::InvalidArgument(format!(
                "relay mask {:#04x} exceeds {:#04x}",
                mask,
                Self::ALL_RELAYS
            )));
        }
        self.handle.send(CommandFrame::new(opcode::OUTPUT_ALL, mask, 0))?;
        debug!(address = self.handle.address(), mask, "Set all relays");
        Ok(())
    }

    /// Relay state byte. Bit 0 is relay 1.
    pub fn state(&self) -> Result<u8> {
        self.handle.get_all_digital_pins()
    }

    pub fn set_led(&self, led: u8, state: PinState) -> Result<()> {
        let led = self.check_led(led)?;
        let op = match state {
            PinState::On => opcode::LED_SET,
            PinState::Off => opcode::LED_CLEAR,
            PinState::Toggle => opcode::LED_TOGGLE,
        };
        self.handle.send(CommandFrame::new(op, led, 0))
    }

    pub fn led_state(&self, led: u8) -> Result<bool> {
        let led = self.check_led(led)?;
        let [state] = self
            .handle
            .query::<1>(CommandFrame::new(opcode::LED_STATE, led, 0))?;
        Ok(state != 0)
    }

    fn check_led(&self, led: u8) -> Result<u8> {
        if led < Self::LEDS {
            Ok(led)
        } else {
            Err(Error::InvalidArgument(format!("LED {} out of range 0..{}", led, Self::LEDS)))
        }
    }
}

impl Plate for RelayPlate {
    fn handle(&self) -> &BoardHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut BoardHandle {
        &mut self.handle
    }
}
