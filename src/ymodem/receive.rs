// Receiving side: download a file into a flash partition

use tracing::{debug, info, warn};

use super::*;
use crate::flash::Flash;
use crate::partition::PartitionId;

/// A file received by [`Ymodem::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name announced by the sender, empty when the session held no file
    pub name: String,
    /// Bytes written to the destination partition
    pub size: u32,
}

enum Frame {
    // Valid packet: sequence number and payload length, payload in buf[3..]
    Data { seq: u8, len: usize },
    Eot,
    Cancel,
    OperatorAbort,
}

enum FrameError {
    Timeout,
    Garbage(u8),
    BadComplement,
    BadCrc,
    Link(UartError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitHeader,
    Data,
    AwaitSessionEnd,
}

async fn read_frame<U: Uart>(uart: &mut U, buf: &mut PacketBuffer, config: &YmodemConfig) -> Result<Frame, FrameError> {
    let header = match uart.recv_byte(config.byte_timeout).await {
        Ok(byte) => byte,
        Err(UartError::Timeout) => return Err(FrameError::Timeout),
        Err(e) => return Err(FrameError::Link(e)),
    };
    let len = match header {
        SOH => PACKET_SIZE,
        STX => PACKET_1K_SIZE,
        EOT => return Ok(Frame::Eot),
        CA => {
            return match uart.recv_byte(config.byte_timeout).await {
                Ok(CA) => Ok(Frame::Cancel),
                Ok(other) => Err(FrameError::Garbage(other)),
                Err(UartError::Timeout) => Err(FrameError::Timeout),
                Err(e) => Err(FrameError::Link(e)),
            };
        }
        ABORT1 | ABORT2 => return Ok(Frame::OperatorAbort),
        other => return Err(FrameError::Garbage(other)),
    };

    buf[0] = header;
    match uart.recv(&mut buf[1..len + PACKET_OVERHEAD], config.byte_timeout).await {
        Ok(()) => {}
        Err(UartError::Timeout) => return Err(FrameError::Timeout),
        Err(e) => return Err(FrameError::Link(e)),
    }
    if buf[1] != !buf[2] {
        return Err(FrameError::BadComplement);
    }
    let crc = u16::from_be_bytes([buf[PACKET_HEADER + len], buf[PACKET_HEADER + len + 1]]);
    if crc16::checksum(&buf[PACKET_HEADER..PACKET_HEADER + len]) != crc {
        return Err(FrameError::BadCrc);
    }
    Ok(Frame::Data { seq: buf[1], len })
}

// Drain whatever is left of a bad packet until the line goes quiet.
// Returns true when the sender cancelled (CA CA) in the drained bytes.
async fn purge<U: Uart>(uart: &mut U, config: &YmodemConfig) -> Result<bool, UartError> {
    let mut last = None;
    loop {
        match uart.recv_byte(config.purge_timeout).await {
            Ok(CA) if last == Some(CA) => return Ok(true),
            Ok(byte) => last = Some(byte),
            Err(UartError::Timeout) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

impl Ymodem {
    /// Receive one file into `destination`
    ///
    /// The destination range is unprotected and erased once the file size is
    /// known, then every accepted packet is written at the running offset. Bytes
    /// beyond the announced size (padding of the last packet) are not written.
    ///
    /// # Arguments
    ///
    /// * `uart` - Serial link to the sender
    /// * `flash` - Board flash
    /// * `buf` - Frame buffer large enough for a 1024-byte packet
    /// * `destination` - Partition receiving the file
    ///
    /// # Returns
    ///
    /// The announced file name and the number of bytes written
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not fit, ends before its announced
    /// size, is cancelled by either side, or too many consecutive packets are
    /// bad. Link and flash failures are passed through.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example() -> anyhow::Result<()> {
    /// use micoboot::ymodem::PACKET_BUFFER_SIZE;
    /// use micoboot::{MemFlash, PartitionId, PartitionTable, StreamUart, Ymodem, YmodemConfig};
    ///
    /// let stream = tokio::net::TcpStream::connect("127.0.0.1:5555").await?;
    /// let mut uart = StreamUart::new(stream);
    /// let mut flash = MemFlash::new(PartitionTable::mk3166());
    /// let mut buf = [0u8; PACKET_BUFFER_SIZE];
    ///
    /// let ymodem = Ymodem::new(YmodemConfig::default());
    /// let file = ymodem.receive(&mut uart, &mut flash, &mut buf, PartitionId::Application).await?;
    /// println!("Received {} ({} bytes)", file.name, file.size);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn receive<U: Uart, F: Flash>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        destination: PartitionId,
    ) -> Result<ReceivedFile, YmodemError> {
        self.receive_internal(uart, flash, buf, destination, &mut None::<fn(usize, usize)>).await
    }

    /// Receive one file into `destination`, reporting `(bytes_written, total)` after each packet
    pub async fn receive_with_progress<U: Uart, F: Flash, P>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        destination: PartitionId,
        mut progress_callback: Option<P>,
    ) -> Result<ReceivedFile, YmodemError>
    where
        P: FnMut(usize, usize),
    {
        self.receive_internal(uart, flash, buf, destination, &mut progress_callback).await
    }

    async fn receive_internal<U: Uart, F: Flash, P>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        destination: PartitionId,
        progress_callback: &mut Option<P>,
    ) -> Result<ReceivedFile, YmodemError>
    where
        P: FnMut(usize, usize),
    {
        let config = &self.config;
        let info = flash.partition_info(destination);
        if !info.is_configured() {
            return Err(FlashError::NotConfigured(destination).into());
        }
        let capacity = info.length;

        let mut state = State::AwaitHeader;
        let mut handshakes = 0u32;
        let mut errors = 0u32;
        let mut expected: u8 = 0;
        let mut file = ReceivedFile { name: String::new(), size: 0 };
        let mut declared: Option<u64> = None;
        let mut offset = 0u32;

        uart.send(&[CRC16]).await?;
        loop {
            if self.abort.is_aborted() {
                send_cancel(uart).await;
                return Err(YmodemError::Aborted(AbortSource::Operator));
            }

            let mut timed_out = false;
            let fault = match read_frame(uart, buf, config).await {
                Ok(Frame::Cancel) => {
                    uart.send(&[ACK]).await?;
                    info!("Transfer cancelled by sender");
                    return Err(YmodemError::Aborted(AbortSource::Peer));
                }
                Ok(Frame::OperatorAbort) => {
                    send_cancel(uart).await;
                    info!("Transfer aborted by operator");
                    return Err(YmodemError::Aborted(AbortSource::Operator));
                }
                Ok(Frame::Eot) if state != State::AwaitHeader => {
                    if let Some(size) = declared.filter(|size| state == State::Data && *size > offset as u64) {
                        send_cancel(uart).await;
                        warn!("EOT after {} of {} bytes", offset, size);
                        return Err(YmodemError::Incomplete { declared: size, received: offset });
                    }
                    // Acknowledge and ask for the next header, which ends the session
                    debug!("EOT after {} bytes", file.size);
                    errors = 0;
                    state = State::AwaitSessionEnd;
                    uart.send(&[ACK, CRC16]).await?;
                    continue;
                }
                Ok(Frame::Eot) => "EOT before file header",
                Ok(Frame::Data { seq, len }) => match state {
                    State::AwaitHeader | State::AwaitSessionEnd if seq == 0 => {
                        errors = 0;
                        let header = match FileHeader::parse(&buf[PACKET_HEADER..PACKET_HEADER + len]) {
                            Some(header) => header,
                            None => {
                                uart.send(&[ACK]).await?;
                                info!("Session closed, {} bytes received", file.size);
                                return Ok(file);
                            }
                        };
                        if state == State::AwaitSessionEnd {
                            // Only one file per session is taken
                            warn!("Refusing additional file '{}'", header.name);
                            send_cancel(uart).await;
                            return Ok(file);
                        }
                        if let Some(size) = header.size {
                            if size > capacity as u64 {
                                send_cancel(uart).await;
                                warn!("Image size {} is higher than partition capacity {}", size, capacity);
                                return Err(YmodemError::TooLarge { size, capacity });
                            }
                        }
                        info!("Receiving '{}' ({:?} bytes) into {}", header.name, header.size, destination);
                        let erase_len = header.size.map(|s| s as u32).unwrap_or(capacity);
                        flash.disable_write_protect(destination, 0, erase_len)?;
                        flash.erase(destination, 0, erase_len)?;

                        declared = header.size;
                        file.name = header.name;
                        state = State::Data;
                        expected = 1;
                        uart.send(&[ACK, CRC16]).await?;
                        continue;
                    }
                    State::Data if seq == expected => {
                        errors = 0;
                        let remaining = match declared {
                            Some(size) => (size - offset as u64) as usize,
                            None => {
                                if offset as u64 + len as u64 > capacity as u64 {
                                    send_cancel(uart).await;
                                    return Err(YmodemError::TooLarge { size: offset as u64 + len as u64, capacity });
                                }
                                len
                            }
                        };
                        let count = len.min(remaining);
                        flash.write(destination, &mut offset, &buf[PACKET_HEADER..PACKET_HEADER + count])?;
                        file.size = offset;
                        expected = expected.wrapping_add(1);
                        if let Some(callback) = progress_callback {
                            callback(offset as usize, declared.map(|s| s as usize).unwrap_or(capacity as usize));
                        }
                        uart.send(&[ACK]).await?;
                        continue;
                    }
                    State::Data if seq == expected.wrapping_sub(1) => {
                        // Our ACK was lost and the sender repeated the packet
                        debug!("Duplicate packet {}", seq);
                        uart.send(&[ACK]).await?;
                        continue;
                    }
                    _ => "unexpected sequence number",
                },
                Err(FrameError::Link(e)) => return Err(e.into()),
                Err(FrameError::Timeout) if state == State::AwaitHeader => {
                    handshakes += 1;
                    if handshakes >= config.handshake_retries {
                        send_cancel(uart).await;
                        return Err(YmodemError::Timeout);
                    }
                    uart.send(&[CRC16]).await?;
                    continue;
                }
                Err(FrameError::Timeout) => {
                    timed_out = true;
                    "timeout"
                }
                Err(FrameError::Garbage(byte)) => {
                    debug!("Unexpected byte 0x{:02x}", byte);
                    "unexpected byte"
                }
                Err(FrameError::BadComplement) => "sequence complement mismatch",
                Err(FrameError::BadCrc) => "CRC mismatch",
            };

            if purge(uart, config).await? {
                uart.send(&[ACK]).await?;
                info!("Transfer cancelled by sender");
                return Err(YmodemError::Aborted(AbortSource::Peer));
            }
            errors += 1;
            warn!("Packet error ({}), {} consecutive", fault, errors);
            if errors > config.max_errors {
                send_cancel(uart).await;
                return Err(YmodemError::VerificationFailed { errors });
            }
            // A silent line while waiting for a header gets the handshake byte again
            let retry = if timed_out && state != State::Data { CRC16 } else { NAK };
            uart.send(&[retry]).await?;
        }
    }
}

/// Receive one file into `destination` with the default settings
pub async fn ymodem_receive<U: Uart, F: Flash>(
    uart: &mut U,
    flash: &mut F,
    buf: &mut PacketBuffer,
    destination: PartitionId,
) -> Result<ReceivedFile, YmodemError> {
    Ymodem::default().receive(uart, flash, buf, destination).await
}
