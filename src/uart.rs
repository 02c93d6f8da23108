//! # Serial link abstraction
//!
//! The YMODEM engine talks to a raw byte stream through the [`Uart`] trait. Reads
//! are bounded by a timeout that restarts every time data arrives, so a slow but
//! steady sender is not cut off while a stalled one is.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors reported by a serial link
#[derive(Error, Debug)]
pub enum UartError {
    /// No byte arrived within the timeout
    #[error("Timed out waiting for data")]
    Timeout,

    /// The other end closed the link
    #[error("Link closed by peer")]
    Closed,

    /// Underlying transport failure
    #[error("UART IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-oriented serial link
///
/// No framing and no flow control: whatever is sent arrives as a plain byte
/// stream at the other end.
#[allow(async_fn_in_trait)]
pub trait Uart {
    /// Send all of `data`
    async fn send(&mut self, data: &[u8]) -> Result<(), UartError>;

    /// Fill `buf` completely, waiting at most `timeout` for each piece of data
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), UartError>;

    /// Receive a single byte
    async fn recv_byte(&mut self, timeout: Duration) -> Result<u8, UartError> {
        let mut byte = [0u8; 1];
        self.recv(&mut byte, timeout).await?;
        Ok(byte[0])
    }
}

/// [`Uart`] over any tokio byte stream (TCP socket, pipe, in-memory duplex)
pub struct StreamUart<S> {
    stream: S,
}

impl<S> StreamUart<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        StreamUart { stream }
    }

    /// Give back the wrapped stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Uart for StreamUart<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), UartError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), UartError> {
        let mut filled = 0;
        while filled < buf.len() {
            match tokio::time::timeout(timeout, self.stream.read(&mut buf[filled..])).await {
                Err(_) => return Err(UartError::Timeout),
                Ok(Ok(0)) => return Err(UartError::Closed),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(UartError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_collects_split_writes() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = StreamUart::new(a);
        let mut rx = StreamUart::new(b);

        tx.send(b"he").await.unwrap();
        tx.send(b"llo").await.unwrap();
        let mut buf = [0u8; 5];
        rx.recv(&mut buf, Duration::from_millis(200)).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn timeout_and_close_are_distinct() {
        let (a, b) = tokio::io::duplex(64);
        let mut rx = StreamUart::new(b);
        assert!(matches!(rx.recv_byte(Duration::from_millis(20)).await, Err(UartError::Timeout)));
        drop(a);
        assert!(matches!(rx.recv_byte(Duration::from_millis(20)).await, Err(UartError::Closed)));
    }
}
