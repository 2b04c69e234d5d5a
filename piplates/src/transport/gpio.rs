//! Control lines through the sysfs GPIO interface.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use crate::hw_trait::{BusError, Level, Line};
use crate::tracing::prelude::*;

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// One exported GPIO, value file held open.
#[derive(Debug)]
pub struct SysfsPin {
    line: Line,
    pin: u32,
    value: File,
}

impl SysfsPin {
    /// udev fixes permissions on new exports asynchronously.
    const EXPORT_RETRIES: u32 = 10;
    const EXPORT_BACKOFF: Duration = Duration::from_millis(50);

    pub fn open(root: &Path, line: Line, pin: u32, direction: Direction) -> Result<Self, BusError> {
        let dir = root.join(format!("gpio{}", pin));
        if !dir.exists() {
            write_attr(line, &root.join("export"), &pin.to_string())?;
            trace!(%line, pin, "Exported GPIO");
        }

        let mut attempt = 0;
        loop {
            match write_attr(line, &dir.join("direction"), direction.as_str()) {
                Ok(()) => break,
                Err(e) if attempt < Self::EXPORT_RETRIES => {
                    trace!(%line, pin, attempt, error = %e, "GPIO not ready");
                    attempt += 1;
                    std::thread::sleep(Self::EXPORT_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        let value = OpenOptions::new()
            .read(true)
            .write(direction == Direction::Out)
            .open(dir.join("value"))
            .map_err(|e| line_error(line, e))?;

        debug!(%line, pin, direction = direction.as_str(), "Opened GPIO");
        Ok(Self { line, pin, value })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn read(&mut self) -> Result<Level, BusError> {
        let mut buf = [0u8; 1];
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read_exact(&mut buf))
            .map_err(|e| line_error(self.line, e))?;
        Ok(Level::from(buf[0] == b'1'))
    }

    pub fn write(&mut self, level: Level) -> Result<(), BusError> {
        let byte: &[u8] = if level.is_high() { b"1" } else { b"0" };
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(byte))
            .map_err(|e| line_error(self.line, e))
    }
}

fn write_attr(line: Line, path: &Path, value: &str) -> Result<(), BusError> {
    fs::write(path, value).map_err(|e| BusError::Line {
        line,
        reason: format!("{}: {}", path.display(), e),
    })
}

fn line_error(line: Line, e: std::io::Error) -> BusError {
    BusError::Line {
        line,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_and_write_value() {
        let root = tempdir().unwrap();
        let dir = root.path().join("gpio25");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();
        fs::write(dir.join("value"), "0\n").unwrap();

        let mut pin = SysfsPin::open(root.path(), Line::Frame, 25, Direction::Out).unwrap();
        assert_eq!(pin.read().unwrap(), Level::Low);
        pin.write(Level::High).unwrap();
        assert_eq!(pin.read().unwrap(), Level::High);
        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "out");
    }

    #[test]
    fn test_missing_export_is_line_error() {
        let root = tempdir().unwrap();
        let missing = root.path().join("absent");
        let err = SysfsPin::open(&missing, Line::Ack, 23, Direction::In).unwrap_err();
        assert!(matches!(err, BusError::Line { line: Line::Ack, .. }));
    }
}
