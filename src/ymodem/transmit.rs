// Sending side: upload a flash partition as a file

use tracing::{debug, info, warn};

use super::*;
use crate::flash::Flash;
use crate::partition::PartitionId;

/// Result of a completed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitSummary {
    /// File size announced and sent
    pub bytes_sent: u32,
    /// Packets that had to be sent more than once
    pub retransmissions: u32,
}

enum Reply {
    Ack,
    Nak,
    Cancel,
    Timeout,
    Other(u8),
}

impl Ymodem {
    async fn read_reply<U: Uart>(&self, uart: &mut U) -> Result<Reply, YmodemError> {
        match uart.recv_byte(self.config.byte_timeout).await {
            Ok(ACK) => Ok(Reply::Ack),
            Ok(NAK) => Ok(Reply::Nak),
            Ok(CA) => match uart.recv_byte(self.config.byte_timeout).await {
                Ok(CA) => Ok(Reply::Cancel),
                Ok(other) => Ok(Reply::Other(other)),
                Err(UartError::Timeout) => Ok(Reply::Other(CA)),
                Err(e) => Err(e.into()),
            },
            Ok(other) => Ok(Reply::Other(other)),
            Err(UartError::Timeout) => Ok(Reply::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    // Wait for the receiver's 'C'; every timeout or other reply uses one of `attempts`
    async fn wait_for_crc_request<U: Uart>(&self, uart: &mut U, attempts: u32) -> Result<bool, YmodemError> {
        for _ in 0..attempts {
            match self.read_reply(uart).await? {
                Reply::Other(CRC16) => return Ok(true),
                Reply::Cancel => return Err(YmodemError::Aborted(AbortSource::Peer)),
                Reply::Timeout => {}
                _ => debug!("Ignoring reply while waiting for 'C'"),
            }
        }
        Ok(false)
    }

    // Send one frame until it is acknowledged
    async fn send_frame<U: Uart>(&self, uart: &mut U, frame: &[u8], retransmissions: &mut u32) -> Result<(), YmodemError> {
        let mut errors = 0u32;
        let mut strays = 0u32;
        let mut resend = true;
        loop {
            if self.abort.is_aborted() {
                send_cancel(uart).await;
                return Err(YmodemError::Aborted(AbortSource::Operator));
            }
            if resend {
                uart.send(frame).await?;
                resend = false;
            }
            match self.read_reply(uart).await? {
                Reply::Ack => return Ok(()),
                Reply::Cancel => return Err(YmodemError::Aborted(AbortSource::Peer)),
                Reply::Nak | Reply::Timeout => {
                    resend = true;
                    *retransmissions += 1;
                    debug!("Retransmitting packet {}", frame[1]);
                }
                // Stray handshake bytes are expected while the receiver is still polling
                Reply::Other(CRC16) if strays < self.config.handshake_retries => {
                    strays += 1;
                    continue;
                }
                Reply::Other(byte) => debug!("Ignoring byte 0x{:02x} while waiting for ACK", byte),
            }
            errors += 1;
            if errors > self.config.max_errors {
                send_cancel(uart).await;
                warn!("No acknowledgement after {} attempts", errors);
                return Err(YmodemError::VerificationFailed { errors });
            }
        }
    }

    /// Send the whole of `source` as a file named `file_name`
    ///
    /// # Arguments
    ///
    /// * `uart` - Serial link to the receiver
    /// * `flash` - Board flash
    /// * `buf` - Frame buffer large enough for a 1024-byte packet
    /// * `source` - Partition to send
    /// * `file_name` - Name announced in packet 0
    ///
    /// # Returns
    ///
    /// Bytes sent and the number of packets that had to be sent again
    ///
    /// # Errors
    ///
    /// Returns an error if the receiver never asks for the file, cancels it, or
    /// stops acknowledging packets, or if the file name cannot be encoded
    pub async fn transmit<U: Uart, F: Flash>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        source: PartitionId,
        file_name: &str,
    ) -> Result<TransmitSummary, YmodemError> {
        let length = flash.partition_info(source).length;
        self.transmit_internal(uart, flash, buf, source, file_name, length, &mut None::<fn(usize, usize)>).await
    }

    /// Send the first `length` bytes of `source`, reporting `(bytes_sent, total)` after each packet
    pub async fn transmit_with_progress<U: Uart, F: Flash, P>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        source: PartitionId,
        file_name: &str,
        length: u32,
        mut progress_callback: Option<P>,
    ) -> Result<TransmitSummary, YmodemError>
    where
        P: FnMut(usize, usize),
    {
        self.transmit_internal(uart, flash, buf, source, file_name, length, &mut progress_callback).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transmit_internal<U: Uart, F: Flash, P>(
        &self,
        uart: &mut U,
        flash: &mut F,
        buf: &mut PacketBuffer,
        source: PartitionId,
        file_name: &str,
        length: u32,
        progress_callback: &mut Option<P>,
    ) -> Result<TransmitSummary, YmodemError>
    where
        P: FnMut(usize, usize),
    {
        let info = flash.partition_info(source);
        if !info.is_configured() {
            return Err(FlashError::NotConfigured(source).into());
        }
        if length > info.length {
            return Err(FlashError::OutOfBounds { partition: source, offset: 0, len: length }.into());
        }
        let header = FileHeader { name: file_name.to_string(), size: Some(length as u64) };
        header.encode(&mut buf[PACKET_HEADER..PACKET_HEADER + PACKET_SIZE])?;

        let mut summary = TransmitSummary { bytes_sent: 0, retransmissions: 0 };

        if !self.wait_for_crc_request(uart, self.config.handshake_retries).await? {
            return Err(YmodemError::Timeout);
        }
        info!("Sending {} ({} bytes) as '{}'", source, length, file_name);

        let frame_len = build_frame(&mut buf[..], 0, PACKET_SIZE);
        self.send_frame(uart, &buf[..frame_len], &mut summary.retransmissions).await?;
        // The receiver asks for data with another 'C'; go on without it if it never comes
        self.wait_for_crc_request(uart, 1).await?;

        let mut offset = 0u32;
        let mut seq: u8 = 1;
        while offset < length {
            let count = ((length - offset) as usize).min(PACKET_1K_SIZE);
            let payload = &mut buf[PACKET_HEADER..PACKET_HEADER + PACKET_1K_SIZE];
            flash.read(source, &mut offset, &mut payload[..count])?;
            payload[count..].fill(0);

            let frame_len = build_frame(&mut buf[..], seq, PACKET_1K_SIZE);
            self.send_frame(uart, &buf[..frame_len], &mut summary.retransmissions).await?;
            summary.bytes_sent = offset;
            seq = seq.wrapping_add(1);
            if let Some(callback) = progress_callback {
                callback(offset as usize, length as usize);
            }
        }

        // EOT is repeated until acknowledged; a NAK asks for the second EOT
        let mut errors = 0u32;
        loop {
            uart.send(&[EOT]).await?;
            match self.read_reply(uart).await? {
                Reply::Ack => break,
                Reply::Cancel => return Err(YmodemError::Aborted(AbortSource::Peer)),
                _ => {
                    errors += 1;
                    if errors > self.config.max_errors {
                        send_cancel(uart).await;
                        return Err(YmodemError::VerificationFailed { errors });
                    }
                }
            }
        }

        // Empty header closes the session
        self.wait_for_crc_request(uart, self.config.max_errors).await?;
        buf[PACKET_HEADER..PACKET_HEADER + PACKET_SIZE].fill(0);
        let frame_len = build_frame(&mut buf[..], 0, PACKET_SIZE);
        self.send_frame(uart, &buf[..frame_len], &mut summary.retransmissions).await?;

        info!("Sent {} bytes, {} retransmissions", summary.bytes_sent, summary.retransmissions);
        Ok(summary)
    }
}

/// Send the whole of `source` as `file_name` with the default settings
pub async fn ymodem_transmit<U: Uart, F: Flash>(
    uart: &mut U,
    flash: &mut F,
    buf: &mut PacketBuffer,
    source: PartitionId,
    file_name: &str,
) -> Result<TransmitSummary, YmodemError> {
    Ymodem::default().transmit(uart, flash, buf, source, file_name).await
}
