//! DAQC2 factory calibration.
//!
//! The plate stores 48 bytes: six per analog channel, holding three signed
//! 16-bit fractions (ADC gain, ADC offset, DAC gain). Each fraction is a
//! sign bit in the top bit of the high byte and a 15-bit magnitude scaled
//! to a per-field span.

use serde::Serialize;

use super::BoardHandle;
use crate::protocol::{opcode, CommandFrame};
use crate::tracing::prelude::*;

/// Gain fields cover +/-4%.
pub const GAIN_SPAN: f64 = 0.04;
/// Offset field covers +/-0.2 V.
pub const OFFSET_SPAN: f64 = 0.2;

const MAGNITUDE_MAX: f64 = 32767.0;

/// Decode one sign-magnitude fraction into `[-span, span]`.
pub fn decode_fraction(hi: u8, lo: u8, span: f64) -> f64 {
    let magnitude = u16::from_be_bytes([hi & 0x7F, lo]) as f64;
    let value = span * magnitude / MAGNITUDE_MAX;
    if hi & 0x80 != 0 {
        -value
    } else {
        value
    }
}

/// Inverse of [`decode_fraction`]. Values beyond the span saturate.
pub fn encode_fraction(value: f64, span: f64) -> [u8; 2] {
    let magnitude = (value.abs() / span * MAGNITUDE_MAX).round().min(MAGNITUDE_MAX) as u16;
    let [hi, lo] = magnitude.to_be_bytes();
    let sign = if value < 0.0 { 0x80 } else { 0 };
    [hi | sign, lo]
}

/// Correction factors for one analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelCalibration {
    pub scale: f64,
    pub offset: f64,
    pub dac_scale: f64,
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
            dac_scale: 1.0,
        }
    }
}

impl ChannelCalibration {
    pub fn decode(raw: &[u8; CalibrationTable::BYTES_PER_CHANNEL]) -> Self {
        Self {
            scale: 1.0 + decode_fraction(raw[0], raw[1], GAIN_SPAN),
            offset: decode_fraction(raw[2], raw[3], OFFSET_SPAN),
            dac_scale: 1.0 + decode_fraction(raw[4], raw[5], GAIN_SPAN),
        }
    }

    /// Correct an uncalibrated ADC reading.
    pub fn apply(&self, volts: f64) -> f64 {
        volts * self.scale + self.offset
    }
}

/// Per-channel calibration for all eight analog inputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CalibrationTable {
    channels: [ChannelCalibration; CalibrationTable::CHANNELS],
}

impl CalibrationTable {
    pub const CHANNELS: usize = 8;
    pub const BYTES_PER_CHANNEL: usize = 6;
    pub const LEN: usize = Self::CHANNELS * Self::BYTES_PER_CHANNEL;

    /// Identity calibration.
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn from_bytes(raw: &[u8; Self::LEN]) -> Self {
        let mut channels = [ChannelCalibration::default(); Self::CHANNELS];
        for (channel, chunk) in channels
            .iter_mut()
            .zip(raw.chunks_exact(Self::BYTES_PER_CHANNEL))
        {
            let mut bytes = [0u8; Self::BYTES_PER_CHANNEL];
            bytes.copy_from_slice(chunk);
            *channel = ChannelCalibration::decode(&bytes);
        }
        Self { channels }
    }

    /// Read the table from the plate, one byte per transaction.
    ///
    /// A byte that cannot be read decodes as zero, which is the neutral
    /// value for every field, so a partly unreadable table degrades to
    /// uncorrected readings rather than failing.
    pub fn read(handle: &BoardHandle) -> Self {
        let mut raw = [0u8; Self::LEN];
        let mut failures = 0;
        for (ptr, byte) in raw.iter_mut().enumerate() {
            match handle.query::<1>(CommandFrame::new(opcode::CALIBRATION, 2, ptr as u8)) {
                Ok([value]) => *byte = value,
                Err(e) => {
                    trace!(ptr, error = %e, "Calibration byte unavailable");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!(
                address = handle.address(),
                failures,
                "Calibration table incomplete, unread bytes treated as neutral"
            );
        }

        let table = Self::from_bytes(&raw);
        debug!(address = handle.address(), table = ?table.channels, "Read calibration");
        table
    }

    pub fn channel(&self, channel: usize) -> Option<&ChannelCalibration> {
        self.channels.get(channel)
    }

    pub fn channels(&self) -> &[ChannelCalibration; Self::CHANNELS] {
        &self.channels
    }
}
