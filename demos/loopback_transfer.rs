use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use micoboot::ymodem::PACKET_BUFFER_SIZE;
use micoboot::{MemFlash, PartitionId, PartitionTable, StreamUart, Ymodem, YmodemConfig};

/// Send the OTA storage of one simulated board into the application partition of
/// another, over an in-memory serial link.
#[tokio::main]
async fn main() -> Result<()> {
    let length = 60_000u32;
    let image: Vec<u8> = (0..length).map(|i| (i % 239) as u8).collect();

    let mut sender_flash = MemFlash::new(PartitionTable::small());
    sender_flash.preload(PartitionId::OtaTemp, 0, &image)?;
    let mut receiver_flash = MemFlash::new(PartitionTable::small());

    let (a, b) = tokio::io::duplex(4096);
    let mut sender_uart = StreamUart::new(a);
    let mut receiver_uart = StreamUart::new(b);
    let sender = Ymodem::new(YmodemConfig::default());
    let receiver = Ymodem::new(YmodemConfig::default());
    let mut sender_buf = [0u8; PACKET_BUFFER_SIZE];
    let mut receiver_buf = [0u8; PACKET_BUFFER_SIZE];

    let bar = ProgressBar::new(length as u64);
    bar.set_style(ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {msg}")?);

    println!("=== YMODEM loopback transfer ===");
    let start = Instant::now();
    let (sent, received) = tokio::join!(
        sender.transmit_with_progress(
            &mut sender_uart,
            &mut sender_flash,
            &mut sender_buf,
            PartitionId::OtaTemp,
            "loopback.bin",
            length,
            Some(|done: usize, _total: usize| bar.set_position(done as u64)),
        ),
        receiver.receive(&mut receiver_uart, &mut receiver_flash, &mut receiver_buf, PartitionId::Application),
    );
    bar.finish();

    let sent = sent?;
    let received = received?;
    let elapsed = start.elapsed();
    println!(
        "✅ Sent {} bytes in {:.2}s ({} retransmissions)",
        sent.bytes_sent,
        elapsed.as_secs_f64(),
        sent.retransmissions
    );
    println!("✅ Received '{}' ({} bytes)", received.name, received.size);

    let written = &receiver_flash.contents(PartitionId::Application)[..length as usize];
    if written == &image[..] {
        println!("✅ Destination matches source");
    } else {
        println!("❌ Destination differs from source");
    }
    Ok(())
}
