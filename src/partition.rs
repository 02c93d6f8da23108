//! # Flash partition descriptors
//!
//! A board describes its flash as a small set of physical devices and a table of
//! logical partitions laid out on them. Everything that touches flash resolves
//! addresses through a [`PartitionTable`] instead of hardcoding them.

use std::fmt::{self, Display};
use std::str::FromStr;

/// Logical partition identifiers
///
/// The numeric values are the ids printed by the memory map and accepted by the
/// `PARUPDATE -id <n>` menu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionId {
    /// Bootloader image
    Bootloader = 0,
    /// Main application image
    Application = 1,
    /// Factory test (ATE) firmware
    Ate = 2,
    /// Scratch area where an OTA image is staged before being committed
    OtaTemp = 3,
    /// Wi-Fi RF driver firmware
    RfFirmware = 4,
    /// First parameter block, holds the boot table at offset 0
    Parameter1 = 5,
    /// Second parameter block
    Parameter2 = 6,
    /// User file system
    Filesys = 7,
}

impl PartitionId {
    /// All partition ids in table order
    pub const ALL: [PartitionId; 8] = [
        PartitionId::Bootloader,
        PartitionId::Application,
        PartitionId::Ate,
        PartitionId::OtaTemp,
        PartitionId::RfFirmware,
        PartitionId::Parameter1,
        PartitionId::Parameter2,
        PartitionId::Filesys,
    ];

    /// Numeric id of the partition
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up a partition by its numeric id
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// File name used when the partition is read out over the serial link
    pub fn upload_file_name(self) -> &'static str {
        match self {
            PartitionId::Bootloader => "BootLoaderImage.bin",
            PartitionId::Application => "ApplicationImage.bin",
            PartitionId::RfFirmware => "DriverImage.bin",
            _ => "Image.bin",
        }
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PartitionId::Bootloader => "bootloader",
            PartitionId::Application => "application",
            PartitionId::Ate => "ate",
            PartitionId::OtaTemp => "ota-temp",
            PartitionId::RfFirmware => "rf-firmware",
            PartitionId::Parameter1 => "parameter1",
            PartitionId::Parameter2 => "parameter2",
            PartitionId::Filesys => "filesys",
        };
        f.write_str(name)
    }
}

impl FromStr for PartitionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(index) = s.parse::<usize>() {
            return PartitionId::from_index(index).ok_or_else(|| format!("No partition with id {}", index));
        }
        match s.to_ascii_lowercase().as_str() {
            "bootloader" | "boot" => Ok(PartitionId::Bootloader),
            "application" | "app" => Ok(PartitionId::Application),
            "ate" => Ok(PartitionId::Ate),
            "ota-temp" | "ota" => Ok(PartitionId::OtaTemp),
            "rf-firmware" | "rf" | "driver" => Ok(PartitionId::RfFirmware),
            "parameter1" | "param1" => Ok(PartitionId::Parameter1),
            "parameter2" | "param2" => Ok(PartitionId::Parameter2),
            "filesys" | "fs" => Ok(PartitionId::Filesys),
            _ => Err(format!("Unknown partition '{}'", s)),
        }
    }
}

/// Physical flash device owning a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashOwner {
    /// Partition is not configured on this board
    None,
    /// MCU embedded flash
    Embedded,
    /// External SPI flash
    Spi,
    /// External QSPI flash
    Qspi,
}

impl FlashOwner {
    /// Device number printed in the memory map
    pub fn device_number(self) -> Option<u8> {
        match self {
            FlashOwner::None => None,
            FlashOwner::Embedded => Some(0),
            FlashOwner::Spi => Some(1),
            FlashOwner::Qspi => Some(2),
        }
    }

    /// Short device name, also used as the image file stem when devices are persisted
    pub fn name(self) -> &'static str {
        match self {
            FlashOwner::None => "none",
            FlashOwner::Embedded => "embedded",
            FlashOwner::Spi => "spi",
            FlashOwner::Qspi => "qspi",
        }
    }
}

/// Access permissions of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionOptions {
    /// Partition content may be read
    pub read: bool,
    /// Partition may be written and erased without first disabling protection
    pub write: bool,
}

impl PartitionOptions {
    /// Readable, write protected
    pub const READ_ONLY: PartitionOptions = PartitionOptions { read: true, write: false };
    /// Readable and writable
    pub const READ_WRITE: PartitionOptions = PartitionOptions { read: true, write: true };
}

/// Descriptor of one logical partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicPartition {
    /// Device the partition lives on
    pub owner: FlashOwner,
    /// Human readable description
    pub description: &'static str,
    /// Absolute start address on the owning device
    pub start_addr: u32,
    /// Length in bytes
    pub length: u32,
    /// Access permissions
    pub options: PartitionOptions,
}

impl LogicPartition {
    /// A partition that is not present on the board
    pub const fn unconfigured() -> Self {
        LogicPartition {
            owner: FlashOwner::None,
            description: "",
            start_addr: 0,
            length: 0,
            options: PartitionOptions { read: false, write: false },
        }
    }

    /// Describe a partition on `owner`
    pub const fn new(owner: FlashOwner, description: &'static str, start_addr: u32, length: u32, options: PartitionOptions) -> Self {
        LogicPartition { owner, description, start_addr, length, options }
    }

    /// Whether the partition is backed by a flash device
    pub fn is_configured(&self) -> bool {
        self.owner != FlashOwner::None
    }
}

/// Physical flash device geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashDevice {
    /// Device identity
    pub owner: FlashOwner,
    /// Address of the first byte of the device
    pub start_addr: u32,
    /// Device size in bytes
    pub length: u32,
}

/// Board flash layout: devices plus the logical partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    devices: Vec<FlashDevice>,
    partitions: [LogicPartition; 8],
}

impl PartitionTable {
    /// Build a table from explicit devices and partitions
    ///
    /// Partitions not listed are left unconfigured.
    pub fn new(devices: Vec<FlashDevice>, partitions: &[(PartitionId, LogicPartition)]) -> Self {
        let mut table = PartitionTable {
            devices,
            partitions: std::array::from_fn(|_| LogicPartition::unconfigured()),
        };
        for (id, partition) in partitions {
            table.partitions[id.index()] = partition.clone();
        }
        table
    }

    /// Layout of the MK3166 module (embedded flash plus QSPI flash)
    pub fn mk3166() -> Self {
        use FlashOwner::*;
        PartitionTable::new(
            vec![
                FlashDevice { owner: Embedded, start_addr: 0x0800_0000, length: 0x10_0000 },
                FlashDevice { owner: Qspi, start_addr: 0x0, length: 0x20_0000 },
            ],
            &[
                (PartitionId::Bootloader, LogicPartition::new(Embedded, "Bootloader", 0x0800_0000, 0x8000, PartitionOptions::READ_ONLY)),
                (PartitionId::Application, LogicPartition::new(Embedded, "Application", 0x0800_8000, 0x9_8000, PartitionOptions::READ_ONLY)),
                (PartitionId::RfFirmware, LogicPartition::new(Qspi, "RF Firmware", 0x2000, 0x3_E000, PartitionOptions::READ_ONLY)),
                (PartitionId::OtaTemp, LogicPartition::new(Qspi, "OTA Storage", 0x4_0000, 0x7_0000, PartitionOptions::READ_WRITE)),
                (PartitionId::Parameter1, LogicPartition::new(Qspi, "PARAMETER1", 0x0, 0x1000, PartitionOptions::READ_WRITE)),
                (PartitionId::Parameter2, LogicPartition::new(Qspi, "PARAMETER2", 0x1000, 0x1000, PartitionOptions::READ_WRITE)),
                (PartitionId::Ate, LogicPartition::new(Embedded, "ATE Firmware", 0x080A_0000, 0x6_0000, PartitionOptions::READ_WRITE)),
                (PartitionId::Filesys, LogicPartition::new(Qspi, "FILESYS", 0x10_0000, 0x10_0000, PartitionOptions::READ_WRITE)),
            ],
        )
    }

    /// Layout of the EMW3081 module (single SPI flash, no RF firmware partition)
    pub fn emw3081() -> Self {
        use FlashOwner::*;
        PartitionTable::new(
            vec![FlashDevice { owner: Spi, start_addr: 0x0, length: 0x10_0000 }],
            &[
                (PartitionId::Bootloader, LogicPartition::new(Spi, "Bootloader", 0xB000, 0x8000, PartitionOptions::READ_ONLY)),
                (PartitionId::Application, LogicPartition::new(Spi, "Application", 0x1_3000, 0x5_9000, PartitionOptions::READ_WRITE)),
                (PartitionId::Parameter1, LogicPartition::new(Spi, "PARAMETER1", 0x6_C000, 0x4000, PartitionOptions::READ_WRITE)),
                (PartitionId::Parameter2, LogicPartition::new(Spi, "PARAMETER2", 0x7_0000, 0x4000, PartitionOptions::READ_WRITE)),
                (PartitionId::Ate, LogicPartition::new(Spi, "ATE", 0x7_4000, 0x3_4000, PartitionOptions::READ_WRITE)),
                (PartitionId::OtaTemp, LogicPartition::new(Spi, "OTA Storage", 0xA_8000, 0x5_8000, PartitionOptions::READ_WRITE)),
            ],
        )
    }

    /// Compact single-device layout, convenient for simulation and tests
    ///
    /// Sizes deliberately avoid multiples of the 4 KiB copy chunk for the
    /// application and OTA partitions.
    pub fn small() -> Self {
        use FlashOwner::*;
        PartitionTable::new(
            vec![FlashDevice { owner: Spi, start_addr: 0x0, length: 0x4_0000 }],
            &[
                (PartitionId::Bootloader, LogicPartition::new(Spi, "Bootloader", 0x0, 0x4000, PartitionOptions::READ_ONLY)),
                (PartitionId::Parameter1, LogicPartition::new(Spi, "PARAMETER1", 0x4000, 0x1000, PartitionOptions::READ_WRITE)),
                (PartitionId::Parameter2, LogicPartition::new(Spi, "PARAMETER2", 0x5000, 0x1000, PartitionOptions::READ_WRITE)),
                (PartitionId::RfFirmware, LogicPartition::new(Spi, "RF Firmware", 0x6000, 0x6000, PartitionOptions::READ_ONLY)),
                (PartitionId::Application, LogicPartition::new(Spi, "Application", 0xC000, 0x1_2800, PartitionOptions::READ_ONLY)),
                (PartitionId::OtaTemp, LogicPartition::new(Spi, "OTA Storage", 0x1_F000, 0x1_3800, PartitionOptions::READ_WRITE)),
            ],
        )
    }

    /// Look up a board preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mk3166" => Some(Self::mk3166()),
            "emw3081" | "emw3081b" => Some(Self::emw3081()),
            "small" => Some(Self::small()),
            _ => None,
        }
    }

    /// Descriptor of a partition, configured or not
    pub fn get(&self, id: PartitionId) -> &LogicPartition {
        &self.partitions[id.index()]
    }

    /// Physical devices of the board
    pub fn devices(&self) -> &[FlashDevice] {
        &self.devices
    }

    /// Geometry of the device backing `owner`
    pub fn device(&self, owner: FlashOwner) -> Option<&FlashDevice> {
        self.devices.iter().find(|d| d.owner == owner)
    }

    /// Configured partitions in id order
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &LogicPartition)> {
        PartitionId::ALL
            .iter()
            .map(move |id| (*id, self.get(*id)))
            .filter(|(_, p)| p.is_configured())
    }

    /// Memory map listing, one line per configured partition
    pub fn memory_map(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, p)| !p.description.is_empty())
            .map(|(id, p)| {
                format!(
                    "|ID:{}| {:>11} |  Dev:{}  | 0x{:08x} | 0x{:08x} |",
                    id.index(),
                    p.description,
                    p.owner.device_number().unwrap_or(0),
                    p.start_addr,
                    p.length
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_place_partitions_inside_their_device() {
        for table in [PartitionTable::mk3166(), PartitionTable::emw3081(), PartitionTable::small()] {
            for (id, p) in table.iter() {
                let dev = table.device(p.owner).unwrap();
                assert!(p.start_addr >= dev.start_addr, "{} starts before its device", id);
                assert!(
                    p.start_addr as u64 + p.length as u64 <= dev.start_addr as u64 + dev.length as u64,
                    "{} overruns its device",
                    id
                );
            }
        }
    }

    #[test]
    fn unconfigured_partitions_are_skipped_in_memory_map() {
        let table = PartitionTable::emw3081();
        assert!(!table.get(PartitionId::RfFirmware).is_configured());
        let map = table.memory_map();
        assert_eq!(map.len(), 6);
        assert!(map.iter().all(|line| !line.contains("RF Firmware")));
        assert_eq!(map[0], "|ID:0|  Bootloader |  Dev:1  | 0x0000b000 | 0x00008000 |");
    }

    #[test]
    fn partition_id_parsing() {
        assert_eq!("3".parse::<PartitionId>().unwrap(), PartitionId::OtaTemp);
        assert_eq!("App".parse::<PartitionId>().unwrap(), PartitionId::Application);
        assert!("9".parse::<PartitionId>().is_err());
        assert!("nvram".parse::<PartitionId>().is_err());
    }
}
