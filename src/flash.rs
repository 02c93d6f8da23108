//! # Flash abstraction
//!
//! The commit engine and the YMODEM engine only see flash through the [`Flash`]
//! trait: partition-relative reads and writes that advance the offset in place,
//! erases, and write-protection control.
//!
//! [`MemFlash`] is an in-memory implementation that behaves like NOR flash: erase
//! sets bytes to 0xFF and a write can only clear bits. It records every mutating
//! operation so callers can check what was touched, can inject faults, and can be
//! persisted to a directory with one image file per flash device.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::partition::{FlashOwner, LogicPartition, PartitionId, PartitionTable};

/// Errors reported by flash operations
#[derive(Error, Debug)]
pub enum FlashError {
    /// The partition has no backing device on this board
    #[error("Partition {0} is not configured")]
    NotConfigured(PartitionId),

    /// The access does not fit inside the partition
    #[error("Access of {len} bytes at offset 0x{offset:x} is outside partition {partition}")]
    OutOfBounds {
        /// Partition accessed
        partition: PartitionId,
        /// Partition-relative offset
        offset: u32,
        /// Access length
        len: u32,
    },

    /// Write or erase on a protected range
    #[error("Partition {0} is write protected")]
    WriteProtected(PartitionId),

    /// The device reported a failure
    #[error("Flash device error: {0}")]
    Device(String),

    /// Device image could not be loaded or saved
    #[error("Flash image IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flash access used by the bootloader core
///
/// Offsets are relative to the start of the partition. `read` and `write` advance
/// `offset` by the number of bytes transferred. Zero-length operations succeed
/// without touching the device.
pub trait Flash {
    /// Descriptor of a partition
    fn partition_info(&self, partition: PartitionId) -> LogicPartition;

    /// Read `buf.len()` bytes at `*offset`
    fn read(&mut self, partition: PartitionId, offset: &mut u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `*offset`; the range must have been erased
    fn write(&mut self, partition: PartitionId, offset: &mut u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes starting at `offset`
    fn erase(&mut self, partition: PartitionId, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Lift write protection on `len` bytes starting at `offset`
    fn disable_write_protect(&mut self, partition: PartitionId, offset: u32, len: u32) -> Result<(), FlashError>;
}

/// A mutating operation recorded by [`MemFlash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Data programmed
    Write {
        /// Target partition
        partition: PartitionId,
        /// Partition-relative offset
        offset: u32,
        /// Bytes written
        len: u32,
    },
    /// Range erased
    Erase {
        /// Target partition
        partition: PartitionId,
        /// Partition-relative offset
        offset: u32,
        /// Bytes erased
        len: u32,
    },
    /// Protection lifted
    DisableProtect {
        /// Target partition
        partition: PartitionId,
        /// Partition-relative offset
        offset: u32,
        /// Length of the range
        len: u32,
    },
}

impl FlashOp {
    /// Partition the operation applies to
    pub fn partition(&self) -> PartitionId {
        match *self {
            FlashOp::Write { partition, .. } | FlashOp::Erase { partition, .. } | FlashOp::DisableProtect { partition, .. } => partition,
        }
    }

    /// Whether the operation changed flash content
    pub fn is_modifying(&self) -> bool {
        !matches!(self, FlashOp::DisableProtect { .. })
    }
}

/// Fault to inject into a [`MemFlash`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The write that would bring the number of writes to `partition` past `after` fails
    WriteError {
        /// Partition to fail
        partition: PartitionId,
        /// Number of writes that succeed first
        after: usize,
    },
    /// The byte at `offset` of `partition` silently ignores programming
    StuckByte {
        /// Partition affected
        partition: PartitionId,
        /// Partition-relative offset of the bad cell
        offset: u32,
    },
}

/// In-memory NOR flash simulator
pub struct MemFlash {
    table: PartitionTable,
    devices: HashMap<FlashOwner, Vec<u8>>,
    unprotected: Vec<(PartitionId, u32, u32)>,
    ops: Vec<FlashOp>,
    writes: HashMap<PartitionId, usize>,
    fault: Option<Fault>,
}

impl MemFlash {
    /// Create a fully erased flash for the given board layout
    pub fn new(table: PartitionTable) -> Self {
        let devices = table
            .devices()
            .iter()
            .map(|d| (d.owner, vec![0xFF; d.length as usize]))
            .collect();
        MemFlash {
            table,
            devices,
            unprotected: Vec::new(),
            ops: Vec::new(),
            writes: HashMap::new(),
            fault: None,
        }
    }

    /// Load device images from `dir`, devices without an image start erased
    pub fn load(table: PartitionTable, dir: &Path) -> Result<Self, FlashError> {
        let mut flash = MemFlash::new(table);
        for (owner, content) in flash.devices.iter_mut() {
            let path = dir.join(format!("{}.bin", owner.name()));
            if !path.exists() {
                continue;
            }
            let image = std::fs::read(&path)?;
            if image.len() != content.len() {
                return Err(FlashError::Device(format!(
                    "Image {} is {} bytes, device is {} bytes",
                    path.display(),
                    image.len(),
                    content.len()
                )));
            }
            content.copy_from_slice(&image);
            debug!("Loaded {} flash image from {}", owner.name(), path.display());
        }
        Ok(flash)
    }

    /// Save every device image into `dir`
    pub fn save(&self, dir: &Path) -> Result<(), FlashError> {
        std::fs::create_dir_all(dir)?;
        for (owner, content) in &self.devices {
            std::fs::write(dir.join(format!("{}.bin", owner.name())), content)?;
        }
        Ok(())
    }

    /// Board layout of this flash
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Mutating operations performed so far
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Forget the recorded operations
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Install or remove an injected fault
    pub fn set_fault(&mut self, fault: Option<Fault>) {
        self.fault = fault;
        self.writes.clear();
    }

    /// Current content of a partition, empty when unconfigured
    pub fn contents(&self, partition: PartitionId) -> &[u8] {
        match self.device_range(partition, 0, self.table.get(partition).length) {
            Ok((owner, start, end)) => &self.devices[&owner][start..end],
            Err(_) => &[],
        }
    }

    /// Overwrite a partition range without erase semantics, protection or journaling
    ///
    /// Used to prepare fixtures.
    pub fn preload(&mut self, partition: PartitionId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let (owner, start, end) = self.device_range(partition, offset, data.len() as u32)?;
        if let Some(device) = self.devices.get_mut(&owner) {
            device[start..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn device_range(&self, partition: PartitionId, offset: u32, len: u32) -> Result<(FlashOwner, usize, usize), FlashError> {
        let info = self.table.get(partition);
        let device = match self.table.device(info.owner) {
            Some(device) if info.is_configured() => device,
            _ => return Err(FlashError::NotConfigured(partition)),
        };
        let end = offset as u64 + len as u64;
        if end > info.length as u64 {
            return Err(FlashError::OutOfBounds { partition, offset, len });
        }
        let start = (info.start_addr - device.start_addr) as usize + offset as usize;
        Ok((info.owner, start, start + len as usize))
    }

    fn check_writable(&self, partition: PartitionId, offset: u32, len: u32) -> Result<(), FlashError> {
        if self.table.get(partition).options.write {
            return Ok(());
        }
        let end = offset as u64 + len as u64;
        let covered = self
            .unprotected
            .iter()
            .any(|&(p, o, l)| p == partition && o <= offset && end <= o as u64 + l as u64);
        if covered { Ok(()) } else { Err(FlashError::WriteProtected(partition)) }
    }
}

impl Flash for MemFlash {
    fn partition_info(&self, partition: PartitionId) -> LogicPartition {
        self.table.get(partition).clone()
    }

    fn read(&mut self, partition: PartitionId, offset: &mut u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if buf.is_empty() {
            return Ok(());
        }
        let (owner, start, end) = self.device_range(partition, *offset, buf.len() as u32)?;
        buf.copy_from_slice(&self.devices[&owner][start..end]);
        *offset += buf.len() as u32;
        Ok(())
    }

    fn write(&mut self, partition: PartitionId, offset: &mut u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u32;
        let (owner, start, end) = self.device_range(partition, *offset, len)?;
        self.check_writable(partition, *offset, len)?;

        let count = self.writes.entry(partition).or_insert(0);
        *count += 1;
        let stuck = match self.fault {
            Some(Fault::WriteError { partition: p, after }) if p == partition && *count > after => {
                return Err(FlashError::Device(format!("Program failure in {} at 0x{:x}", partition, *offset)));
            }
            Some(Fault::StuckByte { partition: p, offset: bad }) if p == partition && bad >= *offset && bad < *offset + len => {
                Some((bad - *offset) as usize)
            }
            _ => None,
        };

        if let Some(device) = self.devices.get_mut(&owner) {
            for (i, (cell, byte)) in device[start..end].iter_mut().zip(data).enumerate() {
                if stuck != Some(i) {
                    *cell &= *byte;
                }
            }
        }
        self.ops.push(FlashOp::Write { partition, offset: *offset, len });
        *offset += len;
        Ok(())
    }

    fn erase(&mut self, partition: PartitionId, offset: u32, len: u32) -> Result<(), FlashError> {
        if len == 0 {
            return Ok(());
        }
        let (owner, start, end) = self.device_range(partition, offset, len)?;
        self.check_writable(partition, offset, len)?;
        if let Some(device) = self.devices.get_mut(&owner) {
            device[start..end].fill(0xFF);
        }
        self.ops.push(FlashOp::Erase { partition, offset, len });
        Ok(())
    }

    fn disable_write_protect(&mut self, partition: PartitionId, offset: u32, len: u32) -> Result<(), FlashError> {
        if len == 0 {
            return Ok(());
        }
        self.device_range(partition, offset, len)?;
        self.unprotected.push((partition, offset, len));
        self.ops.push(FlashOp::DisableProtect { partition, offset, len });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_advances_offset_and_only_clears_bits() {
        let mut flash = MemFlash::new(PartitionTable::small());
        let mut offset = 0;
        flash.write(PartitionId::OtaTemp, &mut offset, &[0xF0, 0x0F]).unwrap();
        assert_eq!(offset, 2);

        // Programming over non-erased cells ANDs the bits
        let mut offset = 0;
        flash.write(PartitionId::OtaTemp, &mut offset, &[0x3C, 0xFF]).unwrap();
        assert_eq!(&flash.contents(PartitionId::OtaTemp)[..3], &[0x30, 0x0F, 0xFF]);
    }

    #[test]
    fn protected_partition_needs_unlock() {
        let mut flash = MemFlash::new(PartitionTable::small());
        let mut offset = 0;
        assert!(matches!(
            flash.write(PartitionId::Application, &mut offset, &[0]),
            Err(FlashError::WriteProtected(PartitionId::Application))
        ));
        assert!(matches!(flash.erase(PartitionId::Application, 0, 16), Err(FlashError::WriteProtected(_))));

        flash.disable_write_protect(PartitionId::Application, 0, 0x1000).unwrap();
        flash.erase(PartitionId::Application, 0, 16).unwrap();
        flash.write(PartitionId::Application, &mut offset, &[0]).unwrap();
        // Unlock only covers the requested range
        assert!(flash.erase(PartitionId::Application, 0x800, 0x1000).is_err());
    }

    #[test]
    fn out_of_bounds_and_unconfigured_are_rejected() {
        let mut flash = MemFlash::new(PartitionTable::emw3081());
        let len = flash.partition_info(PartitionId::Parameter1).length;
        let mut buf = [0u8; 8];
        let mut offset = len - 4;
        assert!(matches!(flash.read(PartitionId::Parameter1, &mut offset, &mut buf), Err(FlashError::OutOfBounds { .. })));
        let mut offset = 0;
        assert!(matches!(flash.read(PartitionId::RfFirmware, &mut offset, &mut buf), Err(FlashError::NotConfigured(_))));
        assert!(flash.contents(PartitionId::RfFirmware).is_empty());
    }

    #[test]
    fn journal_and_faults() {
        let mut flash = MemFlash::new(PartitionTable::small());
        flash.set_fault(Some(Fault::WriteError { partition: PartitionId::OtaTemp, after: 1 }));
        let mut offset = 0;
        flash.write(PartitionId::OtaTemp, &mut offset, &[1, 2, 3]).unwrap();
        assert!(matches!(flash.write(PartitionId::OtaTemp, &mut offset, &[4]), Err(FlashError::Device(_))));
        assert_eq!(offset, 3);
        assert_eq!(flash.ops(), &[FlashOp::Write { partition: PartitionId::OtaTemp, offset: 0, len: 3 }]);

        flash.set_fault(Some(Fault::StuckByte { partition: PartitionId::OtaTemp, offset: 5 }));
        let mut offset = 4;
        flash.write(PartitionId::OtaTemp, &mut offset, &[0, 0, 0]).unwrap();
        assert_eq!(&flash.contents(PartitionId::OtaTemp)[4..7], &[0, 0xFF, 0]);
    }

    #[test]
    fn devices_round_trip_through_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut flash = MemFlash::new(PartitionTable::small());
        let mut offset = 0x10;
        flash.write(PartitionId::Parameter2, &mut offset, b"persisted").unwrap();
        flash.save(dir.path()).unwrap();

        let reloaded = MemFlash::load(PartitionTable::small(), dir.path()).unwrap();
        assert_eq!(&reloaded.contents(PartitionId::Parameter2)[0x10..0x19], b"persisted");
        assert!(reloaded.ops().is_empty());
    }
}
