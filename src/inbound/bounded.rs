//! Budget-limited reader for request heads

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Upper bound for a single budgeted transport read.
const HEADER_CHUNK: usize = 8 * 1024;

/// Current limit applied to reads from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// At most `remaining` more bytes may come from the transport.
    Header { remaining: usize },
    /// No limit.
    Body,
}

/// Reader with an optional byte budget and a push-back buffer.
///
/// In header mode, transport reads are capped at the remaining budget and
/// an exhausted budget reads as EOF without touching the transport. Bytes
/// returned through [`unread`](Self::unread) are replayed first and are not
/// charged to the budget.
pub struct BoundedReader<S> {
    inner: S,
    prefix: BytesMut,
    mode: ReadMode,
    exhausted: bool,
}

impl<S> BoundedReader<S> {
    pub fn new(inner: S) -> Self {
        BoundedReader {
            inner,
            prefix: BytesMut::new(),
            mode: ReadMode::Body,
            exhausted: false,
        }
    }

    /// Allow at most `budget` more bytes from the transport.
    pub fn set_header_mode(&mut self, budget: usize) {
        self.mode = ReadMode::Header { remaining: budget };
        self.exhausted = false;
    }

    /// Lift the budget.
    pub fn set_body_mode(&mut self) {
        self.mode = ReadMode::Body;
        self.exhausted = false;
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// True once a read has been refused because the budget hit zero.
    pub fn budget_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Push bytes back so the next reads return them before anything else.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.prefix.is_empty() {
            self.prefix.extend_from_slice(bytes);
        } else {
            let mut joined = BytesMut::with_capacity(bytes.len() + self.prefix.len());
            joined.extend_from_slice(bytes);
            joined.extend_from_slice(&self.prefix);
            self.prefix = joined;
        }
    }

    /// Number of pushed-back bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.prefix.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> BoundedReader<S> {
    /// Wait until at least one byte is buffered, ignoring the budget.
    ///
    /// Returns `false` when the transport reached EOF with nothing buffered.
    pub async fn fill_buf(&mut self) -> io::Result<bool> {
        if !self.prefix.is_empty() {
            return Ok(true);
        }
        self.prefix.reserve(HEADER_CHUNK);
        let n = self.inner.read_buf(&mut self.prefix).await?;
        Ok(n > 0)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BoundedReader<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if !this.prefix.is_empty() {
            let to_copy = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..to_copy]);
            this.prefix.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        let remaining = match this.mode {
            ReadMode::Body => return Pin::new(&mut this.inner).poll_read(cx, buf),
            ReadMode::Header { remaining } => remaining,
        };

        if remaining == 0 {
            this.exhausted = true;
            return Poll::Ready(Ok(()));
        }

        let mut chunk = [0u8; HEADER_CHUNK];
        let cap = remaining.min(buf.remaining()).min(HEADER_CHUNK);
        let mut limited = ReadBuf::new(&mut chunk[..cap]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.put_slice(limited.filled());
                this.mode = ReadMode::Header {
                    remaining: remaining - n,
                };
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
