use anyhow::Result;
use micoboot::{
    BootTable, CommitBuffers, CommitOutcome, ContentType, MemFlash, PartitionId, PartitionTable, check_and_commit_ota,
    stage_update,
};

/// Stage an application image on a simulated MK3166 board and run the boot-time
/// commit twice: once to apply it, once to show there is nothing left to do.
fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("micoboot=info").init();

    let board = PartitionTable::mk3166();
    println!("Memory map:");
    for line in board.memory_map() {
        println!("  {}", line);
    }

    let mut flash = MemFlash::new(board);
    let image: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();

    println!("\n--- Staging ---");
    let record = stage_update(&mut flash, ContentType::Application, &image)?;
    println!("Boot table: {:02x?}", record.to_bytes());

    println!("\n--- First boot ---");
    let mut buffers = CommitBuffers::new();
    match check_and_commit_ota(&mut flash, &mut buffers)? {
        CommitOutcome::Committed { destination, length } => println!("✅ {} bytes committed to {}", length, destination),
        other => println!("❌ Unexpected outcome: {:?}", other),
    }
    let app = &flash.contents(PartitionId::Application)[..image.len()];
    println!("Application matches image: {}", app == &image[..]);
    println!("Boot table cleared: {}", BootTable::read(&mut flash)?.is_erased());

    println!("\n--- Second boot ---");
    println!("{:?}", check_and_commit_ota(&mut flash, &mut buffers)?);
    Ok(())
}
