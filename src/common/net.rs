//! Network utilities

use socket2::SockRef;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Transport decorator carrying read and write deadlines.
///
/// Once a deadline has passed, every read (or write) on the stream fails
/// with [`io::ErrorKind::TimedOut`] until the deadline is replaced or
/// cleared. Deadlines are absolute, so a slow sequence of small reads still
/// trips the same deadline.
pub struct TimedStream<S> {
    inner: S,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S) -> Self {
        TimedStream {
            inner,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Replace the read deadline; `None` clears it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        reset_deadline(&mut self.read_deadline, deadline);
    }

    /// Replace the write deadline; `None` clears it.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        reset_deadline(&mut self.write_deadline, deadline);
    }

    pub fn clear_deadlines(&mut self) {
        self.read_deadline = None;
        self.write_deadline = None;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.as_ref().map(|s| s.deadline())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.as_ref().map(|s| s.deadline())
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

fn reset_deadline(slot: &mut Option<Pin<Box<Sleep>>>, deadline: Option<Instant>) {
    match deadline {
        Some(at) => match slot {
            Some(sleep) => sleep.as_mut().reset(at),
            None => *slot = Some(Box::pin(tokio::time::sleep_until(at))),
        },
        None => *slot = None,
    }
}

#[inline]
fn expired(slot: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match slot {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", op))
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_without_deadline_passes_through() {
        let (client, server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(server);
        let mut client = client;
        client.write_all(b"abc").await.unwrap();

        let mut buf = [0u8; 3];
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_fires() {
        let (_client, server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(server);
        timed.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let mut buf = [0u8; 1];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_deadline_restores_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(server);
        timed.set_read_deadline(Some(Instant::now()));
        let mut buf = [0u8; 1];
        assert!(timed.read(&mut buf).await.is_err());

        timed.set_read_deadline(None);
        assert!(timed.read_deadline().is_none());
        client.write_all(b"x").await.unwrap();
        assert_eq!(timed.read(&mut buf).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_is_independent_of_read() {
        let (_client, server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(server);
        timed.set_read_deadline(Some(Instant::now()));
        timed.write_all(b"still writable").await.unwrap();

        timed.set_write_deadline(Some(Instant::now()));
        let err = timed.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
