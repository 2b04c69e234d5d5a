//! Inbound response accumulation.

use std::fmt;

use thiserror::Error;

/// Why a transaction produced an invalid response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    /// The bus device could not be used; the plate is assumed offline
    #[error("bus unavailable")]
    BusUnavailable,

    /// The frame line did not read back asserted; nothing was transmitted
    #[error("frame line did not assert")]
    FrameAssertFailure,

    /// The command exchange itself failed
    #[error("command transmit failed")]
    TransmitFailure,

    /// The plate never pulled the acknowledge line low
    #[error("acknowledge timed out")]
    AckTimeout,

    /// Fewer bytes arrived than the read policy required
    #[error("response truncated after {received} bytes")]
    ReadTruncated { received: usize },

    /// The request was rejected before touching the bus
    #[error("invalid request")]
    InvalidArgument,
}

/// Bytes returned by one transaction.
///
/// `valid` is the only signal a decoder may trust: a buffer can hold a
/// partial payload (`len() > 0`) and still be invalid.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseBuffer {
    bytes: [u8; ResponseBuffer::CAPACITY],
    count: usize,
    valid: bool,
    error: Option<TransactionError>,
    ack_timed_out: bool,
}

impl ResponseBuffer {
    /// Largest response any plate command produces, with headroom.
    pub const CAPACITY: usize = 40;

    /// An empty, valid buffer.
    pub fn new() -> Self {
        Self {
            bytes: [0; Self::CAPACITY],
            count: 0,
            valid: true,
            error: None,
            ack_timed_out: false,
        }
    }

    /// An empty buffer already marked invalid.
    pub fn failed(error: TransactionError) -> Self {
        let mut buffer = Self::new();
        buffer.fail(error);
        buffer
    }

    /// Append a byte. Returns false, storing nothing, when full.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.bytes[self.count] = byte;
        self.count += 1;
        true
    }

    /// Mark the buffer invalid. Bytes already received are kept so they
    /// can be logged, but [`ResponseBuffer::data`] stops exposing them.
    pub(crate) fn fail(&mut self, error: TransactionError) {
        self.valid = false;
        self.error = Some(error);
    }

    pub(crate) fn note_ack_timeout(&mut self) {
        self.ack_timed_out = true;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_full(&self) -> bool {
        self.count == Self::CAPACITY
    }

    /// Number of bytes actually received.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn error(&self) -> Option<TransactionError> {
        self.error
    }

    /// True when a write-only command was never acknowledged. The response
    /// stays valid; the plate may simply be slow to settle.
    pub fn ack_timed_out(&self) -> bool {
        self.ack_timed_out
    }

    /// The received bytes, but only if the transaction succeeded.
    pub fn data(&self) -> Option<&[u8]> {
        self.valid.then(|| &self.bytes[..self.count])
    }

    /// The received bytes regardless of validity. For diagnostics only.
    pub fn raw(&self) -> &[u8] {
        &self.bytes[..self.count]
    }

    /// Convert into a `Result`, yielding the payload of a valid response.
    pub fn into_result(self) -> Result<Self, TransactionError> {
        match (self.valid, self.error) {
            (true, _) => Ok(self),
            (false, Some(error)) => Err(error),
            (false, None) => Err(TransactionError::ReadTruncated {
                received: self.count,
            }),
        }
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResponseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("bytes", &hex::encode(self.raw()))
            .field("count", &self.count)
            .field("valid", &self.valid)
            .field("error", &self.error)
            .finish()
    }
}
