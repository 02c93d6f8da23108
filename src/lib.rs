//! # Bootloader firmware-update core for MiCO-style Wi-Fi modules
//!
//! This crate implements the two update paths of a small embedded bootloader:
//!
//! - The **OTA commit engine**, run once at boot. An application stages a new
//!   image in the OTA scratch partition and leaves a record (the *boot table*)
//!   at the start of the first parameter partition. At the next boot the record
//!   is validated, the image copied into its destination with read-back
//!   verification, and the record and scratch area cleared.
//! - The **YMODEM transfer engine**, used by the serial recovery menu. Files are
//!   received over a UART straight into a flash partition, and partitions can be
//!   sent back out as files.
//!
//! Both engines work on a logical partition table rather than raw addresses.
//! Flash and serial hardware are reached through the [`Flash`] and [`Uart`]
//! traits; [`MemFlash`] and [`StreamUart`] provide a simulated flash and a
//! tokio-stream backed link.
//!
//! # Boot flow
//!
//! ```text
//!  power on ──> check_and_commit_ota() ──> jump to application
//!                                     └──> (menu key) YMODEM recovery menu
//! ```
//!
//! See the `micoboot` binary and the demos in the repository for how to use this
//! crate.

#![deny(missing_docs)]

pub mod boot_table;
pub mod crc16;
pub mod flash;
pub mod ota;
pub mod partition;
pub mod uart;
pub mod ymodem;

pub use boot_table::{BootTable, ContentType, LogStatus};
pub use flash::{Flash, FlashError, MemFlash};
pub use ota::{CommitBuffers, CommitError, CommitOutcome, check_and_commit_ota, stage_update};
pub use partition::{PartitionId, PartitionTable};
pub use uart::{StreamUart, Uart, UartError};
pub use ymodem::{AbortSignal, Ymodem, YmodemConfig, YmodemError};
