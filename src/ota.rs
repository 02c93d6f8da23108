//! # OTA commit engine
//!
//! Runs once at boot, before anything else touches flash. When the boot table
//! describes a valid staged image, the image is copied from the OTA scratch
//! partition into its destination, each chunk being read back and compared, then
//! the boot table is cleared and the scratch partition erased.
//!
//! When there is nothing valid to commit, any non-erased byte left in the scratch
//! partition means a previous staging or commit was interrupted; the whole
//! partition is erased so the next boot starts from a known state.
//!
//! No flash operation is retried. The first failure aborts the run and is reported
//! to the caller. A failure during the copy leaves the destination partially
//! written; the record and the scratch data stay in place, so the next boot
//! retries the commit.

use thiserror::Error;
use tracing::{error, info, warn};

use crate::boot_table::{BOOT_TABLE_SIZE, BootTable, ContentType, LogStatus};
use crate::crc16;
use crate::flash::{Flash, FlashError};
use crate::partition::PartitionId;

/// Chunk size used to scan, copy and verify flash content
pub const SIZE_PER_RW: usize = 4096;

/// Errors that abort a commit or staging run
#[derive(Error, Debug)]
pub enum CommitError {
    /// A partition required for OTA is missing from the board layout
    #[error("No OTA support: partition {0} is not configured")]
    Unsupported(PartitionId),

    /// A flash operation failed
    #[error("Flash operation failed: {0}")]
    Flash(#[from] FlashError),

    /// Data read back after programming differs from what was written
    #[error("Write verification failed in {partition} at offset 0x{offset:x}")]
    VerifyMismatch {
        /// Partition being written
        partition: PartitionId,
        /// Offset of the first differing byte
        offset: u32,
    },

    /// Image to stage does not fit the scratch or destination partition
    #[error("Image of {length} bytes does not fit in {capacity} bytes")]
    ImageTooLarge {
        /// Image length
        length: u32,
        /// Smallest of the scratch and destination partition sizes
        capacity: u32,
    },
}

/// What a commit run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing to commit and the scratch partition was already clean
    NoAction(LogStatus),
    /// Nothing to commit; leftover scratch data was erased
    Scrubbed(LogStatus),
    /// The staged image was copied to `destination`
    Committed {
        /// Partition that received the image
        destination: PartitionId,
        /// Number of bytes copied
        length: u32,
    },
}

/// Caller-owned scratch memory for the commit engine
///
/// Two chunk-sized buffers: one holds the data being copied, the other receives
/// the read-back used for verification.
pub struct CommitBuffers {
    data: Box<[u8; SIZE_PER_RW]>,
    verify: Box<[u8; SIZE_PER_RW]>,
}

impl CommitBuffers {
    /// Allocate the buffers
    pub fn new() -> Self {
        CommitBuffers {
            data: Box::new([0xFF; SIZE_PER_RW]),
            verify: Box::new([0xFF; SIZE_PER_RW]),
        }
    }
}

impl Default for CommitBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Inspect the boot table and commit or clean up accordingly
///
/// Meant to run once at boot, before anything else touches flash. A valid record
/// makes the staged image be copied to its destination with read-back
/// verification, then the record and the OTA storage are cleared. Any other
/// record leaves the destination alone and only erases leftover OTA data.
///
/// # Arguments
///
/// * `flash` - Board flash, with the OTA storage and PARAMETER1 partitions configured
/// * `buffers` - Chunk buffers used for copying and verification
///
/// # Returns
///
/// What the run did: nothing, a scrub of OTA storage, or a commit
///
/// # Errors
///
/// Returns an error if the board has no OTA support, if any flash operation
/// fails, or if data read back after programming differs from the source
///
/// # Example
///
/// ```no_run
/// use micoboot::{CommitBuffers, MemFlash, PartitionTable, check_and_commit_ota};
///
/// let mut flash = MemFlash::load(PartitionTable::mk3166(), std::path::Path::new("flash"))?;
/// let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new())?;
/// println!("{:?}", outcome);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn check_and_commit_ota<F: Flash>(flash: &mut F, buffers: &mut CommitBuffers) -> Result<CommitOutcome, CommitError> {
    let result = commit(flash, buffers);
    match &result {
        Ok(outcome) => info!("OTA check finished: {:?}", outcome),
        Err(e) => error!("Update exit with err = {}", e),
    }
    result
}

fn commit<F: Flash>(flash: &mut F, buffers: &mut CommitBuffers) -> Result<CommitOutcome, CommitError> {
    let ota = flash.partition_info(PartitionId::OtaTemp);
    if !ota.is_configured() {
        return Err(CommitError::Unsupported(PartitionId::OtaTemp));
    }
    if !flash.partition_info(PartitionId::Parameter1).is_configured() {
        return Err(CommitError::Unsupported(PartitionId::Parameter1));
    }

    let record = BootTable::read(flash)?;
    let status = record.classify(flash, &mut buffers.data[..])?;
    let content = match status {
        LogStatus::NeedUpdate(content) => content,
        _ => {
            if status != LogStatus::NotExist {
                warn!("Ignoring boot table record: {}", status);
            }
            return scrub_ota_temp(flash, buffers, status);
        }
    };

    let destination = content.destination();
    let dest = flash.partition_info(destination);
    info!("Write OTA data to partition: {}, length {}", dest.description, record.length);

    flash.disable_write_protect(destination, 0, dest.length)?;
    flash.erase(destination, 0, dest.length)?;

    let mut src_offset = 0u32;
    let mut dest_offset = 0u32;
    let mut remaining = record.length as usize;
    while remaining > 0 {
        let len = remaining.min(SIZE_PER_RW);
        let data = &mut buffers.data[..len];
        let verify = &mut buffers.verify[..len];

        flash.read(PartitionId::OtaTemp, &mut src_offset, data)?;
        let chunk_start = dest_offset;
        flash.write(destination, &mut dest_offset, data)?;
        let mut readback_offset = chunk_start;
        flash.read(destination, &mut readback_offset, verify)?;
        if let Some(pos) = data.iter().zip(verify.iter()).position(|(a, b)| a != b) {
            return Err(CommitError::VerifyMismatch { partition: destination, offset: chunk_start + pos as u32 });
        }
        remaining -= len;
    }

    info!("Update start to clear data...");
    write_boot_table(flash, &[0xFF; BOOT_TABLE_SIZE])?;

    flash.disable_write_protect(PartitionId::OtaTemp, 0, ota.length)?;
    flash.erase(PartitionId::OtaTemp, 0, ota.length)?;
    info!("Update success");

    Ok(CommitOutcome::Committed { destination, length: record.length })
}

/// Erase the scratch partition if anything but 0xFF is found in it
fn scrub_ota_temp<F: Flash>(flash: &mut F, buffers: &mut CommitBuffers, status: LogStatus) -> Result<CommitOutcome, CommitError> {
    let length = flash.partition_info(PartitionId::OtaTemp).length;
    let mut offset = 0u32;
    while offset < length {
        let len = ((length - offset) as usize).min(SIZE_PER_RW);
        let data = &mut buffers.data[..len];
        flash.read(PartitionId::OtaTemp, &mut offset, data)?;
        if data.iter().any(|b| *b != 0xFF) {
            warn!("Update data need to be erased");
            flash.disable_write_protect(PartitionId::OtaTemp, 0, length)?;
            flash.erase(PartitionId::OtaTemp, 0, length)?;
            return Ok(CommitOutcome::Scrubbed(status));
        }
    }
    Ok(CommitOutcome::NoAction(status))
}

/// Replace the boot table header, keeping the rest of the parameter partition
fn write_boot_table<F: Flash>(flash: &mut F, header: &[u8; BOOT_TABLE_SIZE]) -> Result<(), FlashError> {
    let length = flash.partition_info(PartitionId::Parameter1).length;
    let mut para = vec![0xFF; length as usize];

    flash.disable_write_protect(PartitionId::Parameter1, 0, length)?;
    let mut offset = 0;
    flash.read(PartitionId::Parameter1, &mut offset, &mut para)?;
    para[..BOOT_TABLE_SIZE].copy_from_slice(header);
    flash.erase(PartitionId::Parameter1, 0, length)?;
    let mut offset = 0;
    flash.write(PartitionId::Parameter1, &mut offset, &para)
}

/// Stage `image` for the next boot
///
/// This is the application side of an OTA update: the image is written to the
/// scratch partition and a boot table record pointing at it is stored. The
/// returned record carries the CRC that the commit engine will check.
///
/// # Arguments
///
/// * `flash` - Board flash
/// * `content` - Kind of image, which selects the destination partition
/// * `image` - Complete image to stage
///
/// # Returns
///
/// The boot table record that was written
///
/// # Errors
///
/// Returns an error if the board lacks a required partition, if the image does
/// not fit the OTA storage or the destination, or if a flash operation fails
pub fn stage_update<F: Flash>(flash: &mut F, content: ContentType, image: &[u8]) -> Result<BootTable, CommitError> {
    let ota = flash.partition_info(PartitionId::OtaTemp);
    if !ota.is_configured() {
        return Err(CommitError::Unsupported(PartitionId::OtaTemp));
    }
    if !flash.partition_info(PartitionId::Parameter1).is_configured() {
        return Err(CommitError::Unsupported(PartitionId::Parameter1));
    }
    let dest = flash.partition_info(content.destination());
    if !dest.is_configured() {
        return Err(CommitError::Unsupported(content.destination()));
    }
    let capacity = ota.length.min(dest.length);
    if image.len() as u64 > capacity as u64 {
        return Err(CommitError::ImageTooLarge { length: image.len() as u32, capacity });
    }

    flash.disable_write_protect(PartitionId::OtaTemp, 0, ota.length)?;
    flash.erase(PartitionId::OtaTemp, 0, ota.length)?;
    let mut offset = 0;
    for chunk in image.chunks(SIZE_PER_RW) {
        flash.write(PartitionId::OtaTemp, &mut offset, chunk)?;
    }

    let record = BootTable::update_request(content, ota.start_addr, image.len() as u32, crc16::checksum(image));
    write_boot_table(flash, &record.to_bytes())?;
    info!("Staged {} bytes for {} (crc 0x{:04x})", image.len(), content.destination(), record.crc);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashOp, MemFlash};
    use crate::partition::PartitionTable;

    #[test]
    fn stage_keeps_parameter_data() {
        let mut flash = MemFlash::new(PartitionTable::small());
        flash.preload(PartitionId::Parameter1, 100, b"wifi-config").unwrap();

        let image: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        let record = stage_update(&mut flash, ContentType::Application, &image).unwrap();

        assert_eq!(&flash.contents(PartitionId::OtaTemp)[..image.len()], &image[..]);
        assert_eq!(&flash.contents(PartitionId::Parameter1)[..BOOT_TABLE_SIZE], &record.to_bytes());
        assert_eq!(&flash.contents(PartitionId::Parameter1)[100..111], b"wifi-config");
    }

    #[test]
    fn stage_rejects_oversized_image() {
        let mut flash = MemFlash::new(PartitionTable::small());
        let boot_len = flash.partition_info(PartitionId::Bootloader).length;
        let image = vec![0u8; boot_len as usize + 1];
        assert!(matches!(
            stage_update(&mut flash, ContentType::Bootloader, &image),
            Err(CommitError::ImageTooLarge { capacity, .. }) if capacity == boot_len
        ));
        assert!(flash.ops().is_empty());
    }

    #[test]
    fn missing_parameter_partition_means_no_ota_support() {
        let table = PartitionTable::small();
        let devices = table.devices().to_vec();
        let partitions: Vec<_> = table
            .iter()
            .filter(|(id, _)| *id != PartitionId::Parameter1)
            .map(|(id, p)| (id, p.clone()))
            .collect();
        let mut flash = MemFlash::new(PartitionTable::new(devices, &partitions));
        let mut buffers = CommitBuffers::new();
        assert!(matches!(
            check_and_commit_ota(&mut flash, &mut buffers),
            Err(CommitError::Unsupported(PartitionId::Parameter1))
        ));
    }

    #[test]
    fn commit_order_of_operations() {
        let mut flash = MemFlash::new(PartitionTable::small());
        let image = vec![0x42; SIZE_PER_RW + 10];
        stage_update(&mut flash, ContentType::Driver, &image).unwrap();
        flash.clear_ops();

        let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::RfFirmware, length: image.len() as u32 });

        let modifying: Vec<_> = flash.ops().iter().filter(|op| op.is_modifying()).copied().collect();
        let rf_len = flash.partition_info(PartitionId::RfFirmware).length;
        let para_len = flash.partition_info(PartitionId::Parameter1).length;
        let ota_len = flash.partition_info(PartitionId::OtaTemp).length;
        assert_eq!(
            modifying,
            vec![
                FlashOp::Erase { partition: PartitionId::RfFirmware, offset: 0, len: rf_len },
                FlashOp::Write { partition: PartitionId::RfFirmware, offset: 0, len: SIZE_PER_RW as u32 },
                FlashOp::Write { partition: PartitionId::RfFirmware, offset: SIZE_PER_RW as u32, len: 10 },
                FlashOp::Erase { partition: PartitionId::Parameter1, offset: 0, len: para_len },
                FlashOp::Write { partition: PartitionId::Parameter1, offset: 0, len: para_len },
                FlashOp::Erase { partition: PartitionId::OtaTemp, offset: 0, len: ota_len },
            ]
        );
    }
}
