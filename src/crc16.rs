//! # CRC-16 used by the boot table and YMODEM
//!
//! Both the staged-image checksum stored in the boot table and the YMODEM packet
//! trailer use CRC-16/XMODEM (polynomial 0x1021, initial value 0, no reflection).

use crc::{CRC_16_XMODEM, Crc, Digest};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC-16 of a complete buffer
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Streaming CRC-16 context
///
/// Used when the data does not fit in one buffer, for example when a staged image
/// is read back from flash chunk by chunk.
pub struct Crc16Context {
    digest: Digest<'static, u16>,
}

impl Crc16Context {
    /// Start a new checksum
    pub fn new() -> Self {
        Crc16Context { digest: CRC16.digest() }
    }

    /// Feed more bytes into the checksum
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Consume the context and return the checksum
    pub fn finalize(self) -> u16 {
        self.digest.finalize()
    }
}

impl Default for Crc16Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xmodem_check_value() {
        assert_eq!(checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let mut ctx = Crc16Context::new();
        for chunk in data.chunks(333) {
            ctx.update(chunk);
        }
        assert_eq!(ctx.finalize(), checksum(&data));
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(Crc16Context::new().finalize(), 0);
    }
}
