//! `micoboot`: drive the bootloader update engines against a simulated board
//!
//! Flash content lives in a directory holding one image file per flash device,
//! so successive commands see each other's effects.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use micoboot::ymodem::{AbortSource, PACKET_BUFFER_SIZE};
use micoboot::{
    CommitBuffers, CommitOutcome, ContentType, Flash, MemFlash, PartitionId, PartitionTable, StreamUart, Ymodem,
    YmodemConfig, YmodemError, check_and_commit_ota, stage_update,
};

#[derive(Parser)]
#[command(name = "micoboot")]
#[command(about = "Bootloader OTA commit and YMODEM recovery on a simulated flash", long_about = None)]
struct Cli {
    /// Directory holding the flash device images
    #[arg(long, default_value = "flash")]
    flash_dir: PathBuf,

    /// Board layout: mk3166, emw3081 or small
    #[arg(long, default_value = "mk3166")]
    board: String,

    /// YMODEM byte timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the partition table
    MemoryMap,
    /// Run the OTA check once, as done at boot
    Commit,
    /// Place an image in OTA storage and request its commit
    Stage {
        /// Content type: B (bootloader), A (application) or D (RF driver)
        content: String,
        /// Image file
        file: PathBuf,
    },
    /// Erase a whole partition
    Erase {
        /// Partition name or id
        partition: String,
    },
    /// Receive a file over YMODEM into a partition
    Download {
        /// Partition name or id
        partition: String,
        /// Address to accept the serial connection on
        #[arg(short, long, default_value = "127.0.0.1:5555")]
        listen: String,
    },
    /// Send a partition as a file over YMODEM
    Upload {
        /// Partition name or id
        partition: String,
        /// Address of the receiving end
        #[arg(short, long)]
        connect: String,
        /// File name announced to the receiver
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "micoboot=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let table = PartitionTable::preset(&cli.board).ok_or_else(|| anyhow!("Unknown board '{}'", cli.board))?;
    let config = YmodemConfig { byte_timeout: Duration::from_millis(cli.timeout_ms), ..YmodemConfig::default() };

    match cli.command {
        Commands::MemoryMap => {
            for line in table.memory_map() {
                println!("{}", line);
            }
        }
        Commands::Commit => commit(table, &cli.flash_dir)?,
        Commands::Stage { content, file } => stage(table, &cli.flash_dir, &content, &file)?,
        Commands::Erase { partition } => erase(table, &cli.flash_dir, parse_partition(&partition)?)?,
        Commands::Download { partition, listen } => {
            download(table, &cli.flash_dir, config, parse_partition(&partition)?, &listen).await?
        }
        Commands::Upload { partition, connect, name } => {
            upload(table, &cli.flash_dir, config, parse_partition(&partition)?, &connect, name).await?
        }
    }

    Ok(())
}

fn parse_partition(s: &str) -> Result<PartitionId> {
    s.parse::<PartitionId>().map_err(|e| anyhow!(e))
}

fn parse_content(s: &str) -> Result<ContentType> {
    let content = match s.as_bytes() {
        [tag] => ContentType::from_tag(tag.to_ascii_uppercase()),
        _ => None,
    };
    content.ok_or_else(|| anyhow!("Content type must be B, A or D, got '{}'", s))
}

fn commit(table: PartitionTable, dir: &Path) -> Result<()> {
    let mut flash = MemFlash::load(table, dir)?;
    let mut buffers = CommitBuffers::new();
    let result = check_and_commit_ota(&mut flash, &mut buffers);
    // Whatever was done before a failure is on the device, as on real hardware
    flash.save(dir)?;
    match result? {
        CommitOutcome::Committed { destination, length } => {
            println!("Committed {} bytes to {}", length, destination)
        }
        CommitOutcome::Scrubbed(status) => println!("Nothing to commit ({}), OTA storage erased", status),
        CommitOutcome::NoAction(status) => println!("Nothing to commit ({})", status),
    }
    Ok(())
}

fn stage(table: PartitionTable, dir: &Path, content: &str, file: &Path) -> Result<()> {
    let content = parse_content(content)?;
    let image = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut flash = MemFlash::load(table, dir)?;
    let record = stage_update(&mut flash, content, &image)?;
    flash.save(dir)?;
    println!(
        "Staged {} bytes for {} (crc 0x{:04x}), run `commit` to apply",
        record.length,
        content.destination(),
        record.crc
    );
    Ok(())
}

fn erase(table: PartitionTable, dir: &Path, partition: PartitionId) -> Result<()> {
    let mut flash = MemFlash::load(table, dir)?;
    let info = flash.partition_info(partition);
    if !info.is_configured() {
        bail!("Partition {} is not configured on this board", partition);
    }
    println!("Erasing {}...", info.description);
    flash.disable_write_protect(partition, 0, info.length)?;
    flash.erase(partition, 0, info.length)?;
    flash.save(dir)?;
    println!("Done");
    Ok(())
}

// Ctrl-C raises the transfer's abort flag
fn abort_on_ctrl_c(ymodem: &Ymodem) {
    let signal = ymodem.abort_signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.abort();
        }
    });
}

async fn download(table: PartitionTable, dir: &Path, config: YmodemConfig, partition: PartitionId, listen: &str) -> Result<()> {
    let mut flash = MemFlash::load(table, dir)?;
    let capacity = flash.partition_info(partition).length;

    let listener = TcpListener::bind(listen).await.with_context(|| format!("Failed to listen on {}", listen))?;
    println!("Waiting for the file to be sent ... (Ctrl-C to abort)");
    let (stream, peer) = listener.accept().await?;
    tracing::info!("Connection from {}", peer);

    let ymodem = Ymodem::new(config);
    abort_on_ctrl_c(&ymodem);
    let mut uart = StreamUart::new(stream);
    let mut buf = [0u8; PACKET_BUFFER_SIZE];
    let result = ymodem
        .receive_with_progress(
            &mut uart,
            &mut flash,
            &mut buf,
            partition,
            Some(|done: usize, total: usize| tracing::debug!("{}/{} bytes", done, total)),
        )
        .await;
    // The partition may already be erased or partly written on failure
    flash.save(dir)?;

    match result {
        Ok(file) => {
            println!("Programming Completed Successfully!");
            println!("   Name: {}", file.name);
            println!("   Size: {} Bytes", file.size);
            Ok(())
        }
        Err(YmodemError::TooLarge { .. }) => {
            bail!("The image size is higher than the allowed space memory ({} bytes)!", capacity)
        }
        Err(YmodemError::VerificationFailed { .. }) => bail!("Verification failed!"),
        Err(YmodemError::Incomplete { declared, received }) => {
            bail!("Transfer ended early: {} of {} bytes received", received, declared)
        }
        Err(YmodemError::Aborted(AbortSource::Operator)) => bail!("Aborted by user."),
        Err(e) => Err(anyhow!("Failed to receive the file: {}", e)),
    }
}

async fn upload(
    table: PartitionTable,
    dir: &Path,
    config: YmodemConfig,
    partition: PartitionId,
    connect: &str,
    name: Option<String>,
) -> Result<()> {
    let mut flash = MemFlash::load(table, dir)?;
    let name = name.unwrap_or_else(|| partition.upload_file_name().to_string());

    let stream = TcpStream::connect(connect).await.with_context(|| format!("Failed to connect to {}", connect))?;
    let ymodem = Ymodem::new(config);
    abort_on_ctrl_c(&ymodem);
    let mut uart = StreamUart::new(stream);
    let mut buf = [0u8; PACKET_BUFFER_SIZE];
    let summary = ymodem.transmit(&mut uart, &mut flash, &mut buf, partition, &name).await?;
    println!(
        "Sent {} as '{}': {} bytes, {} retransmissions",
        partition, name, summary.bytes_sent, summary.retransmissions
    );
    Ok(())
}
