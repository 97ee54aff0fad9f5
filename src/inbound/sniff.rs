//! First-byte protocol detection (TLS record vs. HTTP request line)
//!
//! A TLS client always opens with a record whose content type is one of
//! ChangeCipherSpec (0x14), Alert (0x15), Handshake (0x16) or
//! ApplicationData (0x17). An HTTP/1.x client opens with an upper-case
//! method name. One byte is enough to tell them apart.

use crate::common::TimedStream;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Size of the single classification read.
pub const FIRST_READ_LEN: usize = 576;

/// Result of inspecting the first byte of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Nothing has been read yet
    Undetermined,
    /// First byte is a TLS record content type
    Tls,
    /// First byte starts an HTTP/1.x method
    Http,
    /// Neither; handled per [`UnknownProtocolPolicy`](crate::config::UnknownProtocolPolicy)
    Unknown,
}

/// Classify a connection by its first byte.
///
/// `G H P O D C T` cover GET, HEAD, POST/PUT/PATCH, OPTIONS, DELETE,
/// CONNECT and TRACE.
#[inline]
pub fn classify_first_byte(byte: u8) -> Classification {
    match byte {
        0x14..=0x17 => Classification::Tls,
        b'G' | b'H' | b'P' | b'O' | b'D' | b'C' | b'T' => Classification::Http,
        _ => Classification::Unknown,
    }
}

/// Accepted connection that remembers the bytes consumed for classification.
///
/// Reads replay those bytes exactly once before passing through to the
/// transport, so whatever consumes the stream afterwards (a TLS acceptor)
/// sees the connection from its very first byte.
pub struct SniffedStream<S> {
    inner: TimedStream<S>,
    pending: BytesMut,
    classification: Classification,
}

impl<S> SniffedStream<S> {
    pub fn new(inner: TimedStream<S>) -> Self {
        SniffedStream {
            inner,
            pending: BytesMut::new(),
            classification: Classification::Undetermined,
        }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Bytes read during classification that have not been replayed yet.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn get_ref(&self) -> &TimedStream<S> {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut TimedStream<S> {
        &mut self.inner
    }

    /// Split into the transport and the not-yet-replayed prefix.
    pub fn into_parts(self) -> (TimedStream<S>, BytesMut) {
        (self.inner, self.pending)
    }
}

impl<S: AsyncRead + Unpin> SniffedStream<S> {
    /// Perform the classification read.
    ///
    /// Reads once (at least one byte, at most [`FIRST_READ_LEN`]) and
    /// classifies the connection. Later calls return the stored result
    /// without touching the transport.
    pub async fn sniff(&mut self) -> Result<Classification> {
        if self.classification != Classification::Undetermined {
            return Ok(self.classification);
        }

        let mut first = [0u8; FIRST_READ_LEN];
        let n = self.inner.read(&mut first).await?;
        if n == 0 {
            return Err(Error::connection("closed before sending any byte"));
        }

        self.pending.extend_from_slice(&first[..n]);
        self.classification = classify_first_byte(first[0]);
        Ok(self.classification)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let to_copy = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..to_copy]);
            self.pending.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_tls_record_types() {
        for byte in [0x14u8, 0x15, 0x16, 0x17] {
            assert_eq!(classify_first_byte(byte), Classification::Tls);
        }
    }

    #[test]
    fn test_http_method_initials() {
        for byte in *b"GHPODCT" {
            assert_eq!(classify_first_byte(byte), Classification::Http);
        }
    }

    #[test]
    fn test_everything_else_is_unknown() {
        let known: Vec<u8> = [0x14u8, 0x15, 0x16, 0x17]
            .into_iter()
            .chain(*b"GHPODCT")
            .collect();
        for byte in 0..=u8::MAX {
            if !known.contains(&byte) {
                assert_eq!(classify_first_byte(byte), Classification::Unknown, "{:#x}", byte);
            }
        }
        // lower-case methods are not HTTP/1.1
        assert_eq!(classify_first_byte(b'g'), Classification::Unknown);
    }

    #[tokio::test]
    async fn test_tls_bytes_replayed_unchanged() {
        let hello = [0x16u8, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x03];
        for first in [0x14u8, 0x15, 0x16, 0x17] {
            let mut record = hello;
            record[0] = first;

            let (mut client, server) = tokio::io::duplex(1024);
            client.write_all(&record).await.unwrap();
            drop(client);

            let mut stream = SniffedStream::new(TimedStream::new(server));
            assert_eq!(stream.sniff().await.unwrap(), Classification::Tls);
            assert_eq!(stream.pending(), &record[..]);

            let mut replayed = Vec::new();
            stream.read_to_end(&mut replayed).await.unwrap();
            assert_eq!(replayed, record);
        }
    }

    #[tokio::test]
    async fn test_sniff_reads_only_once() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut stream = SniffedStream::new(TimedStream::new(server));
        assert_eq!(stream.sniff().await.unwrap(), Classification::Http);

        client.write_all(&[0x16]).await.unwrap();
        assert_eq!(stream.sniff().await.unwrap(), Classification::Http);
        assert_eq!(stream.pending(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_eof_before_first_byte() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);

        let mut stream = SniffedStream::new(TimedStream::new(server));
        assert!(matches!(stream.sniff().await, Err(Error::Connection(_))));
        assert_eq!(stream.classification(), Classification::Undetermined);
    }

    #[tokio::test]
    async fn test_replay_spans_small_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x16, 1, 2, 3, 4, 5]).await.unwrap();

        let mut stream = SniffedStream::new(TimedStream::new(server));
        stream.sniff().await.unwrap();

        let mut two = [0u8; 2];
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(two, [0x16, 1]);
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(two, [2, 3]);

        client.write_all(&[6]).await.unwrap();
        let mut three = [0u8; 3];
        stream.read_exact(&mut three).await.unwrap();
        assert_eq!(three, [4, 5, 6]);
    }
}
