//! DAQC2 data acquisition plate.
//!
//! Eight bipolar ADC inputs (+/-12 V) plus a 5 V reference channel, four
//! 0-4.095 V DAC outputs, eight digital inputs with edge interrupts, eight
//! open-collector outputs and an RGB status LED.

use bitflags::bitflags;
use strum::{Display, EnumIter, EnumString, FromRepr};

use super::calibration::CalibrationTable;
use super::{open_handle, BoardHandle, Edge, Plate, PlateModel};
use crate::bus::BusContext;
use crate::error::{Error, Result};
use crate::protocol::{opcode, CommandFrame};
use crate::tracing::prelude::*;

/// ADC full-scale span in volts.
const ADC_SPAN: f64 = 24.0;
/// ADC inputs are bipolar around zero.
const ADC_OFFSET: f64 = 12.0;
const ADC_COUNTS: f64 = 65536.0;
/// The reference channel reads through a fixed 2.4 divider off 5 V.
const REFERENCE_SCALE: f64 = 5.0 * 2.4;

const DAC_MAX_VOLTS: f64 = 4.095;
const DAC_MAX_CODE: u16 = 4095;

bitflags! {
    /// Interrupt flag register. Reading it clears the latched flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqFlags: u16 {
        const DIN0 = 1 << 0;
        const DIN1 = 1 << 1;
        const DIN2 = 1 << 2;
        const DIN3 = 1 << 3;
        const DIN4 = 1 << 4;
        const DIN5 = 1 << 5;
        const DIN6 = 1 << 6;
        const DIN7 = 1 << 7;

        // Firmware may report sources this driver does not name.
        const _ = !0;
    }
}

impl IrqFlags {
    /// Flag for digital input `pin`, if it exists.
    pub fn din(pin: u8) -> Option<Self> {
        (pin < 8).then(|| Self::from_bits_retain(1 << pin))
    }
}

/// RGB status LED colours, in firmware order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, FromRepr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum LedColor {
    Off = 0,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

/// A DAQC2 with its calibration loaded.
#[derive(Debug)]
pub struct Daqc2Plate {
    handle: BoardHandle,
    calibration: CalibrationTable,
}

impl Daqc2Plate {
    pub const ADC_CHANNELS: usize = 8;
    /// Uncalibrated reference input, readable only singly.
    pub const REFERENCE_CHANNEL: i32 = 8;
    pub const DAC_CHANNELS: i32 = 4;

    /// Bind slot `index` and read its calibration table.
    pub fn new(bus: BusContext, index: u8) -> Result<Self> {
        let handle = BoardHandle::new(bus, PlateModel::Daqc2, index)?;
        Ok(Self::with_handle(handle))
    }

    /// Like [`Daqc2Plate::new`], but fails if no DAQC2 answers at the slot.
    pub fn open(bus: BusContext, index: u8) -> Result<Self> {
        let handle = open_handle(bus, PlateModel::Daqc2, index)?;
        Ok(Self::with_handle(handle))
    }

    fn with_handle(handle: BoardHandle) -> Self {
        let calibration = CalibrationTable::read(&handle);
        Self {
            handle,
            calibration,
        }
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// Re-read the calibration table from the plate.
    pub fn reload_calibration(&mut self) {
        self.calibration = CalibrationTable::read(&self.handle);
    }

    /// Raw ADC count to uncalibrated volts.
    pub fn adc_volts(raw: u16) -> f64 {
        f64::from(raw) * ADC_SPAN / ADC_COUNTS - ADC_OFFSET
    }

    /// Volts to DAC code, clamped to the output range.
    pub fn dac_code(volts: f64) -> u16 {
        let volts = volts.clamp(0.0, DAC_MAX_VOLTS);
        let code = (volts / DAC_MAX_VOLTS * f64::from(DAC_MAX_CODE)).round() as u16;
        code.min(DAC_MAX_CODE)
    }

    /// Read one ADC channel in volts. Channel 8 is the reference input.
    pub fn read_analog(&self, channel: i32) -> Result<f64> {
        if !(0..=Self::REFERENCE_CHANNEL).contains(&channel) {
            return Err(Error::InvalidArgument(format!(
                "ADC channel {} out of range 0..={}",
                channel,
                Self::REFERENCE_CHANNEL
            )));
        }
        let raw = self.handle.query::<2>(CommandFrame::new(opcode::ADC_SINGLE, channel as u8, 0))?;
        let raw = u16::from_be_bytes(raw);

        let volts = if channel == Self::REFERENCE_CHANNEL {
            f64::from(raw) * REFERENCE_SCALE / ADC_COUNTS
        } else {
            let uncorrected = Self::adc_volts(raw);
            self.calibration
                .channel(channel as usize)
                .map_or(uncorrected, |cal| cal.apply(uncorrected))
        };
        trace!(channel, raw, volts, "ADC read");
        Ok(volts)
    }

    /// Read ADC channels 0-7 in one transaction.
    pub fn read_all_analog(&self) -> Result<[f64; Self::ADC_CHANNELS]> {
        let raw = self.handle.query::<16>(CommandFrame::bare(opcode::ADC_ALL))?;
        let mut volts = [0.0; Self::ADC_CHANNELS];
        for ((value, pair), cal) in volts
            .iter_mut()
            .zip(raw.chunks_exact(2))
            .zip(self.calibration.channels())
        {
            *value = cal.apply(Self::adc_volts(u16::from_be_bytes([pair[0], pair[1]])));
        }
        Ok(volts)
    }

    /// Drive DAC `channel` to `volts`. Returns the code written.
    pub fn write_analog(&self, channel: i32, volts: f64) -> Result<u16> {
        if !(0..Self::DAC_CHANNELS).contains(&channel) {
            return Err(Error::InvalidArgument(format!(
                "DAC channel {} out of range 0..{}",
                channel,
                Self::DAC_CHANNELS
            )));
        }
        let code = Self::dac_code(volts);
        let [hi, lo] = code.to_be_bytes();
        self.handle
            .send(CommandFrame::new(opcode::DAC_BASE + channel as u8, hi, lo))?;
        debug!(channel, volts, code, "DAC set");
        Ok(code)
    }

    /// Read one digital input.
    pub fn digital_input(&self, pin: i32) -> Result<bool> {
        self.handle.get_digital_pin(pin)
    }

    /// Read all digital inputs.
    pub fn digital_inputs(&self) -> Result<u8> {
        self.handle.get_all_digital_pins()
    }

    /// Drive all eight digital outputs at once.
    pub fn set_digital_outputs(&self, mask: u8) -> Result<()> {
        self.handle.send(CommandFrame::new(opcode::OUTPUT_ALL, mask, 0))
    }

    /// Read back the digital output latch.
    pub fn digital_outputs(&self) -> Result<u8> {
        let [mask] = self.handle.query::<1>(CommandFrame::bare(opcode::OUTPUT_STATE))?;
        Ok(mask)
    }

    /// Arm an interrupt on `edge` of digital input `pin`.
    pub fn enable_edge_interrupt(&self, pin: i32, edge: Edge) -> Result<()> {
        let pin = self.handle.check_pin(pin)?;
        self.handle.send(CommandFrame::new(edge.opcode(), pin, 0))
    }

    pub fn disable_edge_interrupt(&self, pin: i32) -> Result<()> {
        let pin = self.handle.check_pin(pin)?;
        self.handle
            .send(CommandFrame::new(opcode::DIN_IRQ_DISABLE, pin, 0))
    }

    /// Let the plate drive the shared interrupt line.
    pub fn interrupts_enable(&self) -> Result<()> {
        self.handle.send(CommandFrame::bare(opcode::INT_ENABLE))
    }

    pub fn interrupts_disable(&self) -> Result<()> {
        self.handle.send(CommandFrame::bare(opcode::INT_DISABLE))
    }

    /// Read and clear the latched interrupt flags.
    pub fn interrupt_flags(&self) -> Result<IrqFlags> {
        let raw = self.handle.query::<2>(CommandFrame::bare(opcode::INT_FLAGS))?;
        Ok(IrqFlags::from_bits_retain(u16::from_be_bytes(raw)))
    }

    pub fn set_led(&self, color: LedColor) -> Result<()> {
        self.handle
            .send(CommandFrame::new(opcode::LED_SET, color as u8, 0))
    }

    pub fn led(&self) -> Result<LedColor> {
        let [raw] = self.handle.query::<1>(CommandFrame::bare(opcode::LED_STATE))?;
        LedColor::from_repr(raw)
            .ok_or_else(|| Error::Unsupported(format!("unknown LED state {:#04x}", raw)))
    }
}

impl Plate for Daqc2Plate {
    fn handle(&self) -> &BoardHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut BoardHandle {
        &mut self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::calibration::{encode_fraction, GAIN_SPAN};
    use crate::protocol::Timing;
    use crate::transport::sim::{FakeClock, SimBus, SimPlate};
    use test_case::test_case;

    fn plate_with(sim_plate: SimPlate) -> (SimBus, Daqc2Plate) {
        let index = sim_plate.address - PlateModel::Daqc2.base_address();
        let sim = SimBus::new().with_plate(sim_plate);
        let bus = BusContext::new(sim.clone(), FakeClock::new(), Timing::default()).unwrap();
        let plate = Daqc2Plate::open(bus, index).unwrap();
        sim.clear_events();
        (sim, plate)
    }

    #[test_case(0x8000, 0.0)]
    #[test_case(0x0000, -12.0)]
    #[test_case(0xC000, 6.0)]
    fn test_adc_volts(raw: u16, volts: f64) {
        assert!((Daqc2Plate::adc_volts(raw) - volts).abs() < 1e-9);
    }

    #[test_case(1.0, 1000)]
    #[test_case(0.0, 0)]
    #[test_case(5.0, 4095 ; "clamped high")]
    #[test_case(-1.0, 0 ; "clamped low")]
    #[test_case(4.095, 4095)]
    fn test_dac_code(volts: f64, code: u16) {
        assert_eq!(Daqc2Plate::dac_code(volts), code);
    }

    #[test]
    fn test_open_reads_calibration() {
        let mut table = [0u8; CalibrationTable::LEN];
        let [hi, lo] = encode_fraction(0.02, GAIN_SPAN);
        table[0] = hi;
        table[1] = lo;
        let (sim, mut plate) = plate_with(SimPlate::daqc2(0).with_calibration(table));

        assert!((plate.calibration().channel(0).unwrap().scale - 1.02).abs() < 1e-4);

        plate.reload_calibration();
        assert_eq!(sim.exchanges().len(), CalibrationTable::LEN);
        assert!(sim
            .exchanges()
            .iter()
            .enumerate()
            .all(|(ptr, tx)| tx == &vec![32, opcode::CALIBRATION, 2, ptr as u8]));
    }

    #[test]
    fn test_read_analog_applies_calibration() {
        let mut table = [0u8; CalibrationTable::LEN];
        let [hi, lo] = encode_fraction(0.02, GAIN_SPAN);
        table[6] = hi;
        table[7] = lo;
        let (sim, plate) = plate_with(SimPlate::daqc2(1).with_calibration(table));
        sim.with_plate_mut(33, |p| {
            p.adc[0] = 0xC000;
            p.adc[1] = 0xC000;
        });

        assert!((plate.read_analog(0).unwrap() - 6.0).abs() < 1e-9);
        assert!((plate.read_analog(1).unwrap() - 6.12).abs() < 1e-3);

        let all = plate.read_all_analog().unwrap();
        assert!((all[1] - 6.12).abs() < 1e-3);
        assert!(all[2].abs() < 1e-9);
    }

    #[test]
    fn test_reference_channel_skips_calibration() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        sim.with_plate_mut(32, |p| p.adc[8] = 0x4000);
        assert!((plate.read_analog(8).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test_case(-1)]
    #[test_case(9)]
    fn test_adc_channel_rejected(channel: i32) {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        assert!(matches!(plate.read_analog(channel), Err(Error::InvalidArgument(_))));
        assert!(sim.events().is_empty());
    }

    #[test]
    fn test_write_analog() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        assert_eq!(plate.write_analog(2, 1.0).unwrap(), 1000);
        assert_eq!(sim.plate(32).unwrap().dac[2], 1000);
        assert_eq!(sim.exchanges(), vec![vec![32, 0x42, 0x03, 0xE8]]);
        assert!(matches!(plate.write_analog(4, 1.0), Err(Error::InvalidArgument(_))));
    }

    #[test_case(Edge::Falling, opcode::DIN_IRQ_FALLING)]
    #[test_case(Edge::Rising, opcode::DIN_IRQ_RISING)]
    #[test_case(Edge::Both, opcode::DIN_IRQ_BOTH)]
    fn test_edge_opcodes(edge: Edge, op: u8) {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        plate.enable_edge_interrupt(6, edge).unwrap();
        assert_eq!(sim.exchanges(), vec![vec![32, op, 6, 0]]);
    }

    #[test]
    fn test_interrupt_flags_round_trip() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        plate.enable_edge_interrupt(3, Edge::Falling).unwrap();
        plate.interrupts_enable().unwrap();
        sim.with_plate_mut(32, |p| {
            p.set_input(3, true);
            p.set_input(3, false);
        });

        assert!(plate.handle().bus().interrupt_pending().unwrap());
        let flags = plate.interrupt_flags().unwrap();
        assert_eq!(flags, IrqFlags::DIN3);
        assert_eq!(IrqFlags::din(3), Some(IrqFlags::DIN3));
        assert!(!plate.handle().bus().interrupt_pending().unwrap());
    }

    #[test]
    fn test_unknown_flag_bits_retained() {
        let flags = IrqFlags::from_bits_retain(0x8001);
        assert!(flags.contains(IrqFlags::DIN0));
        assert_eq!(flags.bits(), 0x8001);
    }

    #[test]
    fn test_led_colour() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        plate.set_led(LedColor::Magenta).unwrap();
        assert_eq!(sim.plate(32).unwrap().leds, 5);
        assert_eq!(plate.led().unwrap(), LedColor::Magenta);
        assert_eq!("cyan".parse::<LedColor>().unwrap(), LedColor::Cyan);
    }

    #[test]
    fn test_digital_io() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        sim.with_plate_mut(32, |p| p.set_input(4, true));

        assert!(plate.digital_input(4).unwrap());
        assert!(!plate.digital_input(5).unwrap());
        assert_eq!(plate.digital_inputs().unwrap(), 0b0001_0000);

        plate.set_digital_outputs(0xA5).unwrap();
        assert_eq!(plate.digital_outputs().unwrap(), 0xA5);
    }

    #[test]
    fn test_reset_clears_outputs() {
        let (sim, plate) = plate_with(SimPlate::daqc2(0));
        plate.set_digital_outputs(0xFF).unwrap();
        plate.reset().unwrap();
        let state = sim.plate(32).unwrap();
        assert_eq!(state.outputs, 0);
        assert_eq!(state.resets, 1);
    }
}
