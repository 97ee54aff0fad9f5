//! TCP acceptor, per-connection sessions and the shared shutdown flag

use super::handler::RequestHandler;
use super::sniff::{Classification, SniffedStream};
use crate::common::net::configure_tcp_stream;
use crate::common::{Phase, TimedStream};
use crate::config::UnknownProtocolPolicy;
use crate::{Error, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Pause after a failed accept (EMFILE and friends) before retrying.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Process-wide "shutting down" flag.
///
/// Once triggered it stays set; new accepts, new listens and new keep-alive
/// requests are refused, responses already in progress complete.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    shutting_down: AtomicBool,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        let first = !self.shutting_down.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Per-listener connection counters
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    tls: AtomicU64,
    http: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub tls: u64,
    pub http: u64,
    pub rejected: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            tls: self.tls.load(Ordering::Relaxed),
            http: self.http.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Accepts TCP connections and turns each into a [`Session`].
pub struct Listener {
    inner: TcpListener,
    handler: Arc<RequestHandler>,
    unknown_protocol: UnknownProtocolPolicy,
    shutdown: Arc<ShutdownSignal>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub fn new(
        inner: TcpListener,
        handler: Arc<RequestHandler>,
        unknown_protocol: UnknownProtocolPolicy,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Listener {
            inner,
            handler,
            unknown_protocol,
            shutdown,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    /// Wait for the next connection.
    ///
    /// Returns [`Error::ServerClosed`] once shutdown has been requested, also
    /// when shutdown happens while waiting.
    pub async fn accept(&self) -> Result<Session<TcpStream>> {
        if self.shutdown.is_shutting_down() {
            return Err(Error::ServerClosed);
        }

        let (stream, peer) = tokio::select! {
            accepted = self.inner.accept() => accepted?,
            _ = self.shutdown.cancelled() => return Err(Error::ServerClosed),
        };
        if self.shutdown.is_shutting_down() {
            return Err(Error::ServerClosed);
        }

        configure_tcp_stream(&stream);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(
            stream,
            peer,
            self.handler.clone(),
            self.unknown_protocol,
            self.stats.clone(),
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }
}

/// One accepted connection, not yet classified.
pub struct Session<S> {
    stream: SniffedStream<S>,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    unknown_protocol: UnknownProtocolPolicy,
    stats: Arc<ListenerStats>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        handler: Arc<RequestHandler>,
        unknown_protocol: UnknownProtocolPolicy,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Session {
            stream: SniffedStream::new(TimedStream::new(stream)),
            peer,
            handler,
            unknown_protocol,
            stats,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Classify the connection and act on it.
    ///
    /// A TLS connection comes back as a stream that replays the sniffed
    /// bytes, ready for the TLS acceptor. A plaintext HTTP connection is
    /// served to completion here and reported as [`Error::HttpOnHttpsPort`].
    pub async fn negotiate(mut self) -> Result<SniffedStream<S>> {
        let deadline = self.handler.timeouts().deadline(Phase::Header);
        self.stream.get_mut().set_read_deadline(deadline);
        let classification = self.stream.sniff().await?;
        self.stream.get_mut().clear_deadlines();

        match classification {
            Classification::Tls => {
                self.stats.tls.fetch_add(1, Ordering::Relaxed);
                Ok(self.stream)
            }
            Classification::Unknown => match self.unknown_protocol {
                UnknownProtocolPolicy::PassThrough => {
                    debug!("{} unrecognized first byte, passing to TLS", self.peer);
                    self.stats.tls.fetch_add(1, Ordering::Relaxed);
                    Ok(self.stream)
                }
                UnknownProtocolPolicy::Reject => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    let first = self.stream.pending().first().copied().unwrap_or_default();
                    Err(Error::protocol(format!(
                        "unrecognized first byte {:#04x} from {}",
                        first, self.peer
                    )))
                }
            },
            Classification::Http => {
                self.stats.http.fetch_add(1, Ordering::Relaxed);
                let (stream, pending) = self.stream.into_parts();
                if let Err(e) = self.handler.serve(stream, pending, self.peer).await {
                    debug!("HTTP {} session ended: {}", self.peer, e);
                }
                Err(Error::HttpOnHttpsPort)
            }
            Classification::Undetermined => Err(Error::connection("connection not classified")),
        }
    }
}

/// Answer plaintext HTTP on `listener` without sniffing (port 80 companion).
///
/// Sessions are spawned on `sessions` so the caller can wait for them at
/// shutdown. Accept errors are logged and retried.
pub async fn serve_plain_http(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    shutdown: Arc<ShutdownSignal>,
    sessions: TaskTracker,
) -> Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Err(Error::ServerClosed);
        }
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => return Err(Error::ServerClosed),
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Plain HTTP accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        configure_tcp_stream(&stream);

        let handler = handler.clone();
        sessions.spawn(async move {
            if let Err(e) = handler
                .serve(TimedStream::new(stream), Default::default(), peer)
                .await
            {
                debug!("HTTP {} session ended: {}", peer, e);
            }
        });
    }
}
