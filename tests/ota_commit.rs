use micoboot::boot_table::{BOOT_TABLE_SIZE, BootTable, ContentType, LogStatus};
use micoboot::crc16;
use micoboot::flash::{Fault, FlashOp};
use micoboot::ota::{CommitBuffers, CommitError, CommitOutcome, check_and_commit_ota, stage_update};
use micoboot::{Flash, FlashError, MemFlash, PartitionId, PartitionTable};

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + 3) % 251) as u8).collect()
}

// Flash with `data` in OTA storage and `record` at the start of PARAMETER1
fn staged_board(data: &[u8], record: &BootTable) -> MemFlash {
    let mut flash = MemFlash::new(PartitionTable::small());
    flash.preload(PartitionId::OtaTemp, 0, data).unwrap();
    flash.preload(PartitionId::Parameter1, 0, &record.to_bytes()).unwrap();
    flash
}

fn ota_base(flash: &MemFlash) -> u32 {
    flash.partition_info(PartitionId::OtaTemp).start_addr
}

fn touches(flash: &MemFlash, partition: PartitionId) -> bool {
    flash.ops().iter().any(|op| op.partition() == partition && op.is_modifying())
}

#[test]
fn blank_board_is_left_untouched() {
    let mut flash = MemFlash::new(PartitionTable::small());
    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::NoAction(LogStatus::NotExist));
    assert!(flash.ops().iter().all(|op| !op.is_modifying()));
}

#[test]
fn bad_tag_scrubs_ota_storage_only() {
    let data = image(3000);
    let mut record = BootTable::update_request(ContentType::Application, 0, data.len() as u32, crc16::checksum(&data));
    record.upgrade_type = b'X';
    let mut flash = MemFlash::new(PartitionTable::small());
    record.start_address = ota_base(&flash);
    flash.preload(PartitionId::OtaTemp, 0, &data).unwrap();
    flash.preload(PartitionId::Parameter1, 0, &record.to_bytes()).unwrap();

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::Scrubbed(LogStatus::UpdateTagNotExist));
    let ota_len = flash.partition_info(PartitionId::OtaTemp).length;
    assert!(flash.ops().contains(&FlashOp::Erase { partition: PartitionId::OtaTemp, offset: 0, len: ota_len }));
    assert!(flash.contents(PartitionId::OtaTemp).iter().all(|b| *b == 0xFF));
    assert!(!touches(&flash, PartitionId::Application));
    assert!(!touches(&flash, PartitionId::Parameter1));
}

#[test]
fn valid_record_commits_application() {
    let data = image(10_000);
    let mut flash = MemFlash::new(PartitionTable::small());
    let record = BootTable::update_request(ContentType::Application, ota_base(&flash), data.len() as u32, crc16::checksum(&data));
    flash = staged_board(&data, &record);
    // Rest of the parameter block belongs to other components
    flash.preload(PartitionId::Parameter1, 100, b"wifi-credentials").unwrap();
    flash.preload(PartitionId::Application, 0, &[0x00; 64]).unwrap();

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::Application, length: 10_000 });
    let app = flash.contents(PartitionId::Application);
    assert_eq!(&app[..data.len()], &data[..]);
    assert!(app[data.len()..].iter().all(|b| *b == 0xFF));

    let param = flash.contents(PartitionId::Parameter1);
    assert!(param[..BOOT_TABLE_SIZE].iter().all(|b| *b == 0xFF));
    assert_eq!(&param[100..116], b"wifi-credentials");
    assert!(flash.contents(PartitionId::OtaTemp).iter().all(|b| *b == 0xFF));

    // Next boot has nothing left to do
    flash.clear_ops();
    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
    assert_eq!(outcome, CommitOutcome::NoAction(LogStatus::NotExist));
    assert!(flash.ops().iter().all(|op| !op.is_modifying()));
}

#[test]
fn crc_mismatch_is_rejected() {
    let data = image(10_000);
    let flash = MemFlash::new(PartitionTable::small());
    let record = BootTable::update_request(ContentType::Application, ota_base(&flash), data.len() as u32, crc16::checksum(&data) ^ 0x0001);
    let mut flash = staged_board(&data, &record);

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::Scrubbed(LogStatus::CrcError));
    assert!(!touches(&flash, PartitionId::Application));
    assert!(flash.contents(PartitionId::OtaTemp).iter().all(|b| *b == 0xFF));

    // The stale record stays but no longer has anything to scrub
    flash.clear_ops();
    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
    assert_eq!(outcome, CommitOutcome::NoAction(LogStatus::CrcError));
    assert!(flash.ops().is_empty());
}

#[test]
fn crc_skip_value_bypasses_the_check() {
    let data = image(5000);
    let flash = MemFlash::new(PartitionTable::small());
    let record = BootTable::update_request(ContentType::Driver, ota_base(&flash), data.len() as u32, 0xFFFF);
    let mut flash = staged_board(&data, &record);

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::RfFirmware, length: 5000 });
    assert_eq!(&flash.contents(PartitionId::RfFirmware)[..5000], &data[..]);
}

#[test]
fn oversized_record_is_rejected() {
    let flash = MemFlash::new(PartitionTable::small());
    let app_len = flash.partition_info(PartitionId::Application).length;
    let ota_len = flash.partition_info(PartitionId::OtaTemp).length;
    assert!(app_len < ota_len);

    let data = image(ota_len as usize);
    let record = BootTable::update_request(ContentType::Application, ota_base(&flash), app_len + 1, 0xFFFF);
    let mut flash = staged_board(&data, &record);

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();

    assert_eq!(outcome, CommitOutcome::Scrubbed(LogStatus::DataLengthOverflow));
    assert!(!touches(&flash, PartitionId::Application));
}

#[test]
fn verify_mismatch_keeps_record_for_next_boot() {
    let data = image(10_000);
    let flash = MemFlash::new(PartitionTable::small());
    let record = BootTable::update_request(ContentType::Application, ota_base(&flash), data.len() as u32, crc16::checksum(&data));
    let mut flash = staged_board(&data, &record);
    flash.set_fault(Some(Fault::StuckByte { partition: PartitionId::Application, offset: 5000 }));

    let err = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap_err();

    assert!(matches!(
        err,
        CommitError::VerifyMismatch { partition: PartitionId::Application, offset: 5000 }
    ));
    assert_eq!(BootTable::read(&mut flash).unwrap(), record);
    assert_eq!(&flash.contents(PartitionId::OtaTemp)[..data.len()], &data[..]);
    // Chunks after the failing one were never written
    assert!(flash.contents(PartitionId::Application)[8192..].iter().all(|b| *b == 0xFF));

    // Once the cell behaves the retry succeeds
    flash.set_fault(None);
    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::Application, length: 10_000 });
    assert_eq!(&flash.contents(PartitionId::Application)[..data.len()], &data[..]);
}

#[test]
fn program_failure_aborts_without_clearing_record() {
    let data = image(10_000);
    let flash = MemFlash::new(PartitionTable::small());
    let record = BootTable::update_request(ContentType::Application, ota_base(&flash), data.len() as u32, crc16::checksum(&data));
    let mut flash = staged_board(&data, &record);
    flash.set_fault(Some(Fault::WriteError { partition: PartitionId::Application, after: 1 }));

    let err = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap_err();

    assert!(matches!(err, CommitError::Flash(FlashError::Device(_))));
    assert_eq!(BootTable::read(&mut flash).unwrap(), record);
    assert!(!touches(&flash, PartitionId::OtaTemp));
}

#[test]
fn staged_update_is_committed_at_next_boot() {
    let data = image(9000);
    let mut flash = MemFlash::new(PartitionTable::mk3166());

    let record = stage_update(&mut flash, ContentType::Bootloader, &data).unwrap();
    assert_eq!(record.crc, crc16::checksum(&data));
    assert_eq!(record.start_address, flash.partition_info(PartitionId::OtaTemp).start_addr);

    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::Bootloader, length: 9000 });
    assert_eq!(&flash.contents(PartitionId::Bootloader)[..9000], &data[..]);
}

#[test]
fn flash_images_persist_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let data = image(4321);

    let mut flash = MemFlash::load(PartitionTable::small(), dir.path()).unwrap();
    stage_update(&mut flash, ContentType::Application, &data).unwrap();
    flash.save(dir.path()).unwrap();

    let mut flash = MemFlash::load(PartitionTable::small(), dir.path()).unwrap();
    let outcome = check_and_commit_ota(&mut flash, &mut CommitBuffers::new()).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { destination: PartitionId::Application, length: 4321 });
}
