//! Linux spidev character device access.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::{ioctl_write_buf, ioctl_write_ptr};

use crate::hw_trait::BusError;
use crate::tracing::prelude::*;

const SPI_IOC_MAGIC: u8 = b'k';
const SPI_MODE_0: u8 = 0;
const BITS_PER_WORD: u8 = 8;

/// Kernel `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);
ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
ioctl_write_ptr!(spi_write_max_speed, SPI_IOC_MAGIC, 4, u32);

/// An open, configured spidev device.
#[derive(Debug)]
pub struct Spidev {
    file: File,
    path: PathBuf,
    speed_hz: u32,
}

impl Spidev {
    pub fn open(path: &Path, speed_hz: u32) -> Result<Self, BusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BusError::Unavailable(format!("{}: {}", path.display(), e)))?;

        let fd = file.as_raw_fd();
        let configure = |what: &str, result: nix::Result<i32>| {
            result.map(|_| ()).map_err(|e| {
                BusError::Unavailable(format!("{}: set {}: {}", path.display(), what, e))
            })
        };
        // SAFETY: fd is an open spidev descriptor and each pointer refers to
        // a live value of the width the request encodes.
        unsafe {
            configure("mode", spi_write_mode(fd, &SPI_MODE_0))?;
            configure("bits per word", spi_write_bits_per_word(fd, &BITS_PER_WORD))?;
            configure("speed", spi_write_max_speed(fd, &speed_hz))?;
        }

        debug!(device = %path.display(), speed_hz, "Opened SPI device");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            speed_hz,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full-duplex transfer of `tx.len()` bytes. `delay_us` is held after
    /// the last bit before the transfer completes.
    pub fn transfer(&self, tx: &[u8], rx: &mut [u8], delay_us: u16) -> Result<(), BusError> {
        if tx.len() != rx.len() {
            return Err(BusError::Transfer(format!(
                "buffer length mismatch: tx {} rx {}",
                tx.len(),
                rx.len()
            )));
        }
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            delay_usecs: delay_us,
            bits_per_word: BITS_PER_WORD,
            ..Default::default()
        };

        // SAFETY: both buffers outlive the call and are `len` bytes long.
        unsafe { spi_message(self.file.as_raw_fd(), std::slice::from_ref(&transfer)) }
            .map(|_| ())
            .map_err(|e| BusError::Transfer(format!("{}: {}", self.path.display(), e)))
    }
}
