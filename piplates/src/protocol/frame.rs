//! Outbound command frames.

use std::fmt;

/// Plate command opcodes.
///
/// Shared identity commands come first, followed by the per-model command
/// sets. Several opcodes are reused between models with different meaning
/// (0x60 drives a status LED on the relay plate and the RGB LED on the
/// DAQC2), so the board layer picks the right constant for its model.
pub mod opcode {
    pub const ADDRESS: u8 = 0x00;
    pub const ID: u8 = 0x01;
    pub const HW_REVISION: u8 = 0x02;
    pub const FW_REVISION: u8 = 0x03;
    pub const RESET: u8 = 0x0F;

    pub const OUTPUT_ON: u8 = 0x10;
    pub const OUTPUT_OFF: u8 = 0x11;
    pub const OUTPUT_TOGGLE: u8 = 0x12;
    pub const OUTPUT_ALL: u8 = 0x13;
    pub const OUTPUT_STATE: u8 = 0x14;

    pub const INT_ENABLE: u8 = 0x04;
    pub const INT_DISABLE: u8 = 0x05;
    pub const INT_FLAGS: u8 = 0x06;

    pub const DIN_BIT: u8 = 0x20;
    pub const DIN_IRQ_FALLING: u8 = 0x21;
    pub const DIN_IRQ_RISING: u8 = 0x22;
    pub const DIN_IRQ_BOTH: u8 = 0x23;
    pub const DIN_IRQ_DISABLE: u8 = 0x24;
    pub const DIN_ALL: u8 = 0x25;

    pub const ADC_SINGLE: u8 = 0x30;
    pub const ADC_ALL: u8 = 0x31;

    /// DAC channel `n` is addressed as `DAC_BASE + n`.
    pub const DAC_BASE: u8 = 0x40;

    pub const LED_SET: u8 = 0x60;
    pub const LED_CLEAR: u8 = 0x61;
    pub const LED_TOGGLE: u8 = 0x62;
    pub const LED_STATE: u8 = 0x63;

    pub const CALIBRATION: u8 = 0xFD;
}

/// One outbound transaction: `[destination, opcode, arg1, arg2]`.
///
/// The destination byte is reserved. Callers only supply the opcode and
/// arguments; the engine stamps the destination address immediately before
/// transmitting, overwriting whatever the slot held.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; CommandFrame::LEN],
}

impl CommandFrame {
    /// Bytes clocked out per transaction.
    pub const LEN: usize = 4;

    pub fn new(opcode: u8, arg1: u8, arg2: u8) -> Self {
        Self {
            bytes: [0, opcode, arg1, arg2],
        }
    }

    /// A frame with no arguments.
    pub fn bare(opcode: u8) -> Self {
        Self::new(opcode, 0, 0)
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[1]
    }

    pub fn args(&self) -> (u8, u8) {
        (self.bytes[2], self.bytes[3])
    }

    pub fn destination(&self) -> u8 {
        self.bytes[0]
    }

    /// Overwrite the destination slot. Only the engine calls this.
    pub(crate) fn stamp(&mut self, address: u8) {
        self.bytes[0] = address;
    }

    pub fn as_bytes(&self) -> &[u8; CommandFrame::LEN] {
        &self.bytes
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandFrame({})", hex::encode(self.bytes))
    }
}
