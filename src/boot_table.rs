//! # Boot table record
//!
//! The boot table is a 24-byte record at offset 0 of the first parameter
//! partition. An application that has staged a new image in the OTA scratch
//! partition writes it; the bootloader reads it on the next boot to decide whether
//! an update must be committed.
//!
//! Layout (little endian):
//!
//! | Offset | Size | Field           |
//! |--------|------|-----------------|
//! | 0      | 4    | `start_address` |
//! | 4      | 4    | `length`        |
//! | 8      | 8    | `version`       |
//! | 16     | 1    | `type`          |
//! | 17     | 1    | `upgrade_type`  |
//! | 18     | 2    | `crc`           |
//! | 20     | 4    | reserved        |

use std::fmt::{self, Display};

use crate::crc16::Crc16Context;
use crate::flash::{Flash, FlashError};
use crate::partition::PartitionId;

/// Size of the serialized record
pub const BOOT_TABLE_SIZE: usize = 24;

/// `upgrade_type` value requesting an update
pub const UPGRADE_TAG: u8 = b'U';

/// `crc` value meaning the image checksum is not verified
pub const CRC_SKIP: u16 = 0xFFFF;

/// Kind of image described by the record, and so its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// 'B': bootloader image
    Bootloader,
    /// 'A': application image
    Application,
    /// 'D': RF driver firmware
    Driver,
}

impl ContentType {
    /// Decode the `type` byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'B' => Some(ContentType::Bootloader),
            b'A' => Some(ContentType::Application),
            b'D' => Some(ContentType::Driver),
            _ => None,
        }
    }

    /// Encoded `type` byte
    pub fn tag(self) -> u8 {
        match self {
            ContentType::Bootloader => b'B',
            ContentType::Application => b'A',
            ContentType::Driver => b'D',
        }
    }

    /// Partition the image is committed to
    pub fn destination(self) -> PartitionId {
        match self {
            ContentType::Bootloader => PartitionId::Bootloader,
            ContentType::Application => PartitionId::Application,
            ContentType::Driver => PartitionId::RfFirmware,
        }
    }
}

/// Result of checking a boot table record
///
/// Only [`LogStatus::NeedUpdate`] is actionable. Every other value leads to the
/// scratch partition being scrubbed instead of committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    /// Record is blank (all 0xFF)
    NotExist,
    /// Record is valid, the staged image must be committed
    NeedUpdate(ContentType),
    /// `upgrade_type` is not 'U'
    UpdateTagNotExist,
    /// `start_address` is not the OTA scratch partition base
    StartAddressError,
    /// `type` is unknown or its destination partition is not configured
    ContentTypeNotExist,
    /// `length` does not fit the destination or the scratch partition
    DataLengthOverflow,
    /// Checksum of the staged image does not match `crc`
    CrcError,
}

impl Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogStatus::NotExist => write!(f, "no update record"),
            LogStatus::NeedUpdate(content) => write!(f, "update pending for {}", content.destination()),
            LogStatus::UpdateTagNotExist => write!(f, "update tag missing"),
            LogStatus::StartAddressError => write!(f, "start address does not match OTA storage"),
            LogStatus::ContentTypeNotExist => write!(f, "unknown content type"),
            LogStatus::DataLengthOverflow => write!(f, "image length overflows destination"),
            LogStatus::CrcError => write!(f, "image CRC mismatch"),
        }
    }
}

/// Decoded boot table record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTable {
    /// Address of the staged image; must be the OTA scratch partition base
    pub start_address: u32,
    /// Image length in bytes
    pub length: u32,
    /// Free-form version string
    pub version: [u8; 8],
    /// Destination selector ('B', 'A' or 'D')
    pub content_type: u8,
    /// 'U' when an update is requested
    pub upgrade_type: u8,
    /// CRC-16 of the staged image, [`CRC_SKIP`] to skip the check
    pub crc: u16,
    /// Reserved bytes, preserved as read
    pub reserved: [u8; 4],
}

impl BootTable {
    /// A blank (erased) record
    pub fn erased() -> Self {
        BootTable::from_bytes(&[0xFF; BOOT_TABLE_SIZE])
    }

    /// Record requesting an update of `content` from the staged image
    pub fn update_request(content: ContentType, start_address: u32, length: u32, crc: u16) -> Self {
        BootTable {
            start_address,
            length,
            version: [0; 8],
            content_type: content.tag(),
            upgrade_type: UPGRADE_TAG,
            crc,
            reserved: [0xFF; 4],
        }
    }

    /// Decode a record from its raw bytes
    pub fn from_bytes(bytes: &[u8; BOOT_TABLE_SIZE]) -> Self {
        BootTable {
            start_address: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            version: [bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]],
            content_type: bytes[16],
            upgrade_type: bytes[17],
            crc: u16::from_le_bytes([bytes[18], bytes[19]]),
            reserved: [bytes[20], bytes[21], bytes[22], bytes[23]],
        }
    }

    /// Encode the record
    pub fn to_bytes(&self) -> [u8; BOOT_TABLE_SIZE] {
        let mut bytes = [0u8; BOOT_TABLE_SIZE];
        bytes[0..4].copy_from_slice(&self.start_address.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.length.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.version);
        bytes[16] = self.content_type;
        bytes[17] = self.upgrade_type;
        bytes[18..20].copy_from_slice(&self.crc.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.reserved);
        bytes
    }

    /// Whether every byte of the record is 0xFF
    pub fn is_erased(&self) -> bool {
        self.to_bytes().iter().all(|b| *b == 0xFF)
    }

    /// Read the record from the first parameter partition
    pub fn read<F: Flash>(flash: &mut F) -> Result<Self, FlashError> {
        let mut bytes = [0u8; BOOT_TABLE_SIZE];
        let mut offset = 0;
        flash.read(PartitionId::Parameter1, &mut offset, &mut bytes)?;
        Ok(BootTable::from_bytes(&bytes))
    }

    /// Check the record against the partition table and the staged image
    ///
    /// `scratch` is used to stream the staged image for the CRC check. Checks run
    /// in a fixed order and the first failing one determines the result.
    pub fn classify<F: Flash>(&self, flash: &mut F, scratch: &mut [u8]) -> Result<LogStatus, FlashError> {
        if self.is_erased() {
            return Ok(LogStatus::NotExist);
        }
        if self.upgrade_type != UPGRADE_TAG {
            return Ok(LogStatus::UpdateTagNotExist);
        }
        let ota = flash.partition_info(PartitionId::OtaTemp);
        if self.start_address != ota.start_addr {
            return Ok(LogStatus::StartAddressError);
        }
        let content = match ContentType::from_tag(self.content_type) {
            Some(content) => content,
            None => return Ok(LogStatus::ContentTypeNotExist),
        };
        let destination = flash.partition_info(content.destination());
        if !destination.is_configured() {
            return Ok(LogStatus::ContentTypeNotExist);
        }
        if self.length > destination.length || self.length > ota.length {
            return Ok(LogStatus::DataLengthOverflow);
        }
        if self.crc != CRC_SKIP && staged_crc(flash, self.length, scratch)? != self.crc {
            return Ok(LogStatus::CrcError);
        }
        Ok(LogStatus::NeedUpdate(content))
    }
}

/// CRC-16 of the first `length` bytes of the OTA scratch partition
///
/// An empty `scratch` falls back to a small stack buffer.
pub fn staged_crc<F: Flash>(flash: &mut F, length: u32, scratch: &mut [u8]) -> Result<u16, FlashError> {
    let mut fallback = [0u8; 256];
    let scratch = if scratch.is_empty() { &mut fallback[..] } else { scratch };
    let mut ctx = Crc16Context::new();
    let mut offset = 0;
    let mut remaining = length as usize;
    while remaining > 0 {
        let len = remaining.min(scratch.len());
        flash.read(PartitionId::OtaTemp, &mut offset, &mut scratch[..len])?;
        ctx.update(&scratch[..len]);
        remaining -= len;
    }
    Ok(ctx.finalize())
}
