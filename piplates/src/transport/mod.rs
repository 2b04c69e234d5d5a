//! Physical transport layer for the plate bus.
//!
//! Implementations of [`crate::hw_trait::BusTransport`]: the Linux spidev
//! device plus sysfs GPIO control lines used on a Raspberry Pi, and an
//! in-process simulator. Neither has any knowledge of the plate protocol
//! beyond moving bytes and sampling lines.

pub mod sim;

#[cfg(target_os = "linux")]
pub mod gpio;
#[cfg(target_os = "linux")]
pub mod spidev;

#[cfg(target_os = "linux")]
pub use linux::LinuxBus;

#[cfg(target_os = "linux")]
mod linux {
    use super::gpio::{Direction, SysfsPin};
    use super::spidev::Spidev;
    use crate::config::BusConfig;
    use crate::hw_trait::{BusError, BusTransport, Level, Line};
    use crate::tracing::prelude::*;

    /// SPI device plus frame, acknowledge and interrupt lines.
    #[derive(Debug)]
    pub struct LinuxBus {
        spi: Spidev,
        frame: SysfsPin,
        ack: SysfsPin,
        interrupt: Option<SysfsPin>,
    }

    impl LinuxBus {
        pub fn open(config: &BusConfig) -> Result<Self, BusError> {
            let spi = Spidev::open(&config.spi_device, config.clock_hz)?;
            let root = config.gpio_root.as_path();

            let mut frame = SysfsPin::open(root, Line::Frame, config.frame_pin, Direction::Out)?;
            frame.write(Level::Low)?;
            let ack = SysfsPin::open(root, Line::Ack, config.ack_pin, Direction::In)?;
            let interrupt = config
                .interrupt_pin
                .map(|pin| SysfsPin::open(root, Line::Interrupt, pin, Direction::In))
                .transpose()?;

            info!(
                device = %spi.path().display(),
                frame = config.frame_pin,
                ack = config.ack_pin,
                interrupt = ?config.interrupt_pin,
                "Opened plate bus"
            );
            Ok(Self {
                spi,
                frame,
                ack,
                interrupt,
            })
        }

        fn pin(&mut self, line: Line) -> Result<&mut SysfsPin, BusError> {
            match line {
                Line::Frame => Ok(&mut self.frame),
                Line::Ack => Ok(&mut self.ack),
                Line::Interrupt => self.interrupt.as_mut().ok_or(BusError::Line {
                    line,
                    reason: "not configured".into(),
                }),
            }
        }
    }

    impl BusTransport for LinuxBus {
        fn exchange(&mut self, tx: &[u8]) -> Result<(), BusError> {
            let mut rx = vec![0u8; tx.len()];
            self.spi.transfer(tx, &mut rx, 0)
        }

        fn read_byte(&mut self, timeout_us: u32) -> Result<u8, BusError> {
            let mut rx = [0u8; 1];
            let delay = u16::try_from(timeout_us).unwrap_or(u16::MAX);
            self.spi.transfer(&[0], &mut rx, delay)?;
            Ok(rx[0])
        }

        fn set_line(&mut self, line: Line, level: Level) -> Result<(), BusError> {
            match line {
                Line::Frame => self.frame.write(level),
                other => Err(BusError::Line {
                    line: other,
                    reason: "input only".into(),
                }),
            }
        }

        fn read_line(&mut self, line: Line) -> Result<Level, BusError> {
            self.pin(line)?.read()
        }
    }
}
