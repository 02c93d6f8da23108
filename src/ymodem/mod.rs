//! # YMODEM file transfer
//!
//! Serial recovery path of the bootloader: a file is received over a [`Uart`]
//! link and streamed straight into a flash partition, or a partition is sent out
//! as a file.
//!
//! Framing of one packet:
//!
//! ```text
//! +--------+-----+------+----------------------+---------+
//! | header | seq | !seq | payload (128 / 1024) | CRC16BE |
//! +--------+-----+------+----------------------+---------+
//! ```
//!
//! `SOH` announces a 128-byte payload, `STX` a 1024-byte one. Packet 0 carries the
//! file name and size; an empty packet 0 ends the session. The CRC is
//! CRC-16/XMODEM over the payload.
//!
//! [`Uart`]: crate::uart::Uart

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::crc16;
use crate::flash::FlashError;
use crate::uart::{Uart, UartError};

mod receive;
mod transmit;

pub use receive::{ReceivedFile, ymodem_receive};
pub use transmit::{TransmitSummary, ymodem_transmit};

/// Start of a 128-byte packet
pub const SOH: u8 = 0x01;
/// Start of a 1024-byte packet
pub const STX: u8 = 0x02;
/// End of transmission
pub const EOT: u8 = 0x04;
/// Acknowledge
pub const ACK: u8 = 0x06;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// Cancel, two in a row abort the transfer
pub const CA: u8 = 0x18;
/// Receiver request for a CRC-mode transfer
pub const CRC16: u8 = b'C';
/// Operator abort key
pub const ABORT1: u8 = b'A';
/// Operator abort key
pub const ABORT2: u8 = b'a';

/// Payload size of a SOH packet
pub const PACKET_SIZE: usize = 128;
/// Payload size of a STX packet
pub const PACKET_1K_SIZE: usize = 1024;
/// Header, sequence number and its complement
pub const PACKET_HEADER: usize = 3;
/// Trailing CRC
pub const PACKET_TRAILER: usize = 2;
/// Bytes of framing around the payload
pub const PACKET_OVERHEAD: usize = PACKET_HEADER + PACKET_TRAILER;
/// Size of a buffer able to hold the largest frame
pub const PACKET_BUFFER_SIZE: usize = PACKET_1K_SIZE + PACKET_OVERHEAD;

/// Caller-owned frame buffer used by both directions
pub type PacketBuffer = [u8; PACKET_BUFFER_SIZE];

/// Transfer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YmodemConfig {
    /// Longest wait for the next byte of input
    pub byte_timeout: Duration,
    /// How many times the initial handshake is attempted before giving up
    pub handshake_retries: u32,
    /// Consecutive packet errors tolerated before the transfer is abandoned
    pub max_errors: u32,
    /// Quiet time that ends line draining after a bad packet
    pub purge_timeout: Duration,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        YmodemConfig {
            byte_timeout: Duration::from_secs(1),
            handshake_retries: 30,
            max_errors: 5,
            purge_timeout: Duration::from_millis(50),
        }
    }
}

/// Who stopped a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    /// The other end sent two CA bytes
    Peer,
    /// The local operator pressed the abort key or raised the [`AbortSignal`]
    Operator,
}

/// Ways a transfer can fail
#[derive(Error, Debug)]
pub enum YmodemError {
    /// The announced file does not fit in the destination partition
    #[error("Image size {size} is higher than partition capacity {capacity}")]
    TooLarge {
        /// Announced or received size
        size: u64,
        /// Destination capacity
        capacity: u32,
    },

    /// Too many consecutive bad or missing packets
    #[error("Verification failed after {errors} consecutive errors")]
    VerificationFailed {
        /// Number of consecutive errors when giving up
        errors: u32,
    },

    /// The transfer was cancelled
    #[error("Aborted by {0:?}")]
    Aborted(AbortSource),

    /// The sender ended the file before the size announced in packet 0
    #[error("File ended after {received} of {declared} announced bytes")]
    Incomplete {
        /// Size announced in packet 0
        declared: u64,
        /// Bytes written before the end of file
        received: u32,
    },

    /// The other end never answered the handshake
    #[error("No response from peer")]
    Timeout,

    /// The file name cannot be carried in packet 0
    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),

    /// Flash access failed
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// The serial link failed
    #[error("Link error: {0}")]
    Uart(#[from] UartError),
}

/// Shared flag used to cancel a transfer from outside
///
/// Checked between packets; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// New, not raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the transfer to stop
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before reuse
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// File name and size carried by packet 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File name
    pub name: String,
    /// Announced size, absent when the sender did not provide one
    pub size: Option<u64>,
}

impl FileHeader {
    /// Parse the payload of packet 0
    ///
    /// Returns `None` for the empty header that ends a session.
    pub fn parse(payload: &[u8]) -> Option<FileHeader> {
        if payload.first().is_none_or(|b| *b == 0) {
            return None;
        }
        let name_end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

        let rest = payload.get(name_end + 1..).unwrap_or(&[]);
        let field_end = rest.iter().position(|b| *b == b' ' || *b == 0).unwrap_or(rest.len());
        let size = std::str::from_utf8(&rest[..field_end]).ok().and_then(parse_size);
        Some(FileHeader { name, size })
    }

    /// Encode into a packet 0 payload, `name\0size\0` followed by zeros
    pub fn encode(&self, payload: &mut [u8]) -> Result<(), YmodemError> {
        let size = self.size.map(|s| s.to_string()).unwrap_or_default();
        if self.name.is_empty() || self.name.contains('\0') || self.name.len() + size.len() + 2 > payload.len() {
            return Err(YmodemError::InvalidFileName(self.name.clone()));
        }
        payload.fill(0);
        payload[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let start = self.name.len() + 1;
        payload[start..start + size.len()].copy_from_slice(size.as_bytes());
        Ok(())
    }
}

// Decimal, or hexadecimal with a 0x prefix
fn parse_size(field: &str) -> Option<u64> {
    let field = field.trim();
    match field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

/// Frame `payload` (128 or 1024 bytes) into `buf`, returning the frame length
pub(crate) fn build_frame(buf: &mut [u8], seq: u8, payload_len: usize) -> usize {
    buf[0] = if payload_len == PACKET_1K_SIZE { STX } else { SOH };
    buf[1] = seq;
    buf[2] = !seq;
    let crc = crc16::checksum(&buf[PACKET_HEADER..PACKET_HEADER + payload_len]);
    buf[PACKET_HEADER + payload_len..PACKET_HEADER + payload_len + PACKET_TRAILER].copy_from_slice(&crc.to_be_bytes());
    payload_len + PACKET_OVERHEAD
}

/// Tell the peer to stop
pub(crate) async fn send_cancel<U: Uart>(uart: &mut U) {
    // The link may already be gone; the caller reports the original error
    let _ = uart.send(&[CA, CA]).await;
}

/// YMODEM endpoint: transfer settings plus the abort flag
///
/// The link and the flash are passed to each transfer, so one endpoint can be
/// reused across menu commands.
#[derive(Debug, Clone, Default)]
pub struct Ymodem {
    config: YmodemConfig,
    abort: AbortSignal,
}

impl Ymodem {
    /// Endpoint with the given settings
    pub fn new(config: YmodemConfig) -> Self {
        Ymodem { config, abort: AbortSignal::new() }
    }

    /// Endpoint sharing an externally owned abort flag
    pub fn with_abort(config: YmodemConfig, abort: AbortSignal) -> Self {
        Ymodem { config, abort }
    }

    /// Transfer settings
    pub fn config(&self) -> &YmodemConfig {
        &self.config
    }

    /// Abort flag checked between packets
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parse_variants() {
        let mut payload = [0u8; PACKET_SIZE];
        payload[..13].copy_from_slice(b"app.bin\x0012345");
        assert_eq!(
            FileHeader::parse(&payload),
            Some(FileHeader { name: "app.bin".into(), size: Some(12345) })
        );

        // lrzsz style: size followed by modification time and mode
        let mut payload = [0u8; PACKET_SIZE];
        payload[..22].copy_from_slice(b"fw\x00100 14017214 100644");
        assert_eq!(FileHeader::parse(&payload).unwrap().size, Some(100));

        let mut payload = [0u8; PACKET_SIZE];
        payload[..9].copy_from_slice(b"x\x000x1000 ");
        assert_eq!(FileHeader::parse(&payload).unwrap().size, Some(0x1000));

        let mut payload = [0u8; PACKET_SIZE];
        payload[..2].copy_from_slice(b"x\x00");
        assert_eq!(FileHeader::parse(&payload).unwrap().size, None);

        assert_eq!(FileHeader::parse(&[0u8; PACKET_SIZE]), None);
    }

    #[test]
    fn header_encode_limits() {
        let mut payload = [0xAAu8; PACKET_SIZE];
        let header = FileHeader { name: "Image.bin".into(), size: Some(4097) };
        header.encode(&mut payload).unwrap();
        assert_eq!(&payload[..15], b"Image.bin\x004097\x00");
        assert!(payload[15..].iter().all(|b| *b == 0));
        assert_eq!(FileHeader::parse(&payload), Some(header));

        let long = FileHeader { name: "n".repeat(120), size: Some(1_000_000) };
        assert!(matches!(long.encode(&mut payload), Err(YmodemError::InvalidFileName(_))));
        let empty = FileHeader { name: String::new(), size: Some(1) };
        assert!(empty.encode(&mut payload).is_err());
    }

    #[test]
    fn frame_layout() {
        let mut buf = [0u8; PACKET_BUFFER_SIZE];
        buf[PACKET_HEADER..PACKET_HEADER + PACKET_SIZE].fill(0x11);
        let len = build_frame(&mut buf, 0xFF, PACKET_SIZE);
        assert_eq!(len, 133);
        assert_eq!(&buf[..3], &[SOH, 0xFF, 0x00]);
        let crc = crc16::checksum(&[0x11; PACKET_SIZE]);
        assert_eq!(&buf[131..133], &crc.to_be_bytes());

        assert_eq!(build_frame(&mut buf, 1, PACKET_1K_SIZE), PACKET_BUFFER_SIZE);
        assert_eq!(buf[0], STX);
    }

    #[test]
    fn abort_signal_is_shared() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        clone.abort();
        assert!(signal.is_aborted());
        signal.reset();
        assert!(!clone.is_aborted());
    }
}
