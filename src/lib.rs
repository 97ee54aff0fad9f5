//! HTTPS Port Guard - answer plaintext HTTP that lands on a TLS port
//!
//! Clients that speak `http://host:443` instead of `https://host:443`
//! normally get an opaque handshake failure. The guard looks at the first
//! byte of every accepted connection: TLS records go on to the TLS stack
//! untouched, HTTP request lines are parsed with a bounded header budget
//! and answered directly, by default with a redirect to the HTTPS URL.
//!
//! # Architecture
//!
//! ```text
//!   TcpListener
//!        |
//! +------v-------+      TLS byte      +-------------+     +------------+
//! |   Listener   +--> Session ------->| TlsAcceptor +---->| TlsService |
//! +--------------+   (sniff first     +-------------+     +------------+
//!                     byte)  |
//!                            | HTTP method byte
//!                     +------v---------+
//!                     | RequestHandler |  BoundedReader -> Request
//!                     |  (keep-alive)  |  HttpHandler / redirect
//!                     +----------------+  ResponseBuilder -> flush
//! ```

pub mod common;
pub mod config;
pub mod inbound;

pub use common::error::{Error, Result};
pub use config::Config;
pub use inbound::{HttpHandler, RequestBody, ResponseBuilder};

use async_trait::async_trait;
use inbound::listener::{serve_plain_http, ACCEPT_ERROR_BACKOFF};
use inbound::{Listener, RequestHandler, Session, ShutdownSignal, SniffedStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TLS stream handed to a [`TlsService`].
pub type TlsStream = tokio_rustls::server::TlsStream<SniffedStream<TcpStream>>;

/// Consumer of connections that completed the TLS handshake.
#[async_trait]
pub trait TlsService: Send + Sync + 'static {
    async fn serve(&self, stream: TlsStream, peer: SocketAddr) -> Result<()>;
}

/// TLS server front that also answers plaintext HTTP on the same port.
pub struct Server {
    config: Config,
    handler: Option<Arc<dyn HttpHandler>>,
    shutdown: Arc<ShutdownSignal>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Server {
            config,
            handler: None,
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// Answer plaintext requests with `handler` instead of redirecting.
    pub fn with_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    /// Stop accepting. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    fn request_handler(&self) -> Arc<RequestHandler> {
        let handler = RequestHandler::new(&self.config, self.shutdown.clone());
        Arc::new(match &self.handler {
            Some(h) => handler.with_handler(h.clone()),
            None => handler,
        })
    }

    /// Wrap an already bound socket.
    pub fn listener(&self, tcp: TcpListener) -> Listener {
        Listener::new(
            tcp,
            self.request_handler(),
            self.config.unknown_protocol,
            self.shutdown.clone(),
        )
    }

    /// Bind the configured `listen` address.
    pub async fn bind(&self) -> Result<Listener> {
        if self.is_shutting_down() {
            return Err(Error::ServerClosed);
        }
        let tcp = TcpListener::bind(&self.config.listen).await?;
        Ok(self.listener(tcp))
    }

    /// Bind, load the configured certificate and serve until shutdown.
    ///
    /// Always returns an error; [`Error::ServerClosed`] after a shutdown.
    pub async fn listen_and_serve_tls<T: TlsService>(&self, service: Arc<T>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ServerClosed);
        }
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| Error::config("tls cert and key are required"))?;
        let acceptor = inbound::tls::build_acceptor(&tls.cert, &tls.key)?;
        let listener = self.bind().await?;
        self.serve_tls(listener, acceptor, service).await
    }

    /// Accept loop: one task per connection.
    ///
    /// After shutdown the in-flight sessions get `shutdown-timeout-ms` to
    /// finish before this returns [`Error::ServerClosed`].
    pub async fn serve_tls<T: TlsService>(
        &self,
        listener: Listener,
        acceptor: TlsAcceptor,
        service: Arc<T>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTPS port guard listening on {}", addr);
        }
        let sessions = TaskTracker::new();
        let companion = self.spawn_port_80_companion(&listener, &sessions).await?;
        let handshake_timeout = self.config.timeouts().duration(common::Phase::Header);

        loop {
            let session = match listener.accept().await {
                Ok(session) => session,
                Err(Error::ServerClosed) => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let service = service.clone();
            sessions.spawn(async move {
                handle_session(session, acceptor, service, handshake_timeout).await;
            });
        }

        if let Some(handle) = companion {
            let _ = handle.await;
        }
        self.drain_sessions(&sessions).await;
        debug!("Listener stats at shutdown: {:?}", listener.stats().snapshot());
        Err(Error::ServerClosed)
    }

    async fn drain_sessions(&self, sessions: &TaskTracker) {
        sessions.close();
        if sessions.is_empty() {
            return;
        }
        info!("Waiting for {} in-flight sessions", sessions.len());
        match self.config.shutdown_grace() {
            Some(limit) => {
                if tokio::time::timeout(limit, sessions.wait()).await.is_err() {
                    warn!("{} sessions still running after {:?}", sessions.len(), limit);
                }
            }
            None => sessions.wait().await,
        }
    }

    async fn spawn_port_80_companion(
        &self,
        listener: &Listener,
        sessions: &TaskTracker,
    ) -> Result<Option<JoinHandle<()>>> {
        if !self.config.listen_80_redirect_to_443 {
            return Ok(None);
        }
        let addr = listener.local_addr()?;
        if addr.port() != 443 {
            return Ok(None);
        }

        let plain_addr = SocketAddr::new(addr.ip(), 80);
        let tcp = TcpListener::bind(plain_addr).await.map_err(|e| {
            Error::config(format!("listen-80-redirect-to-443: bind {}: {}", plain_addr, e))
        })?;
        info!("Plain HTTP listening on {}", plain_addr);

        let handler = self.request_handler();
        let shutdown = self.shutdown.clone();
        let sessions = sessions.clone();
        Ok(Some(tokio::spawn(async move {
            match serve_plain_http(tcp, handler, shutdown, sessions).await {
                Ok(()) | Err(Error::ServerClosed) => {}
                Err(e) => warn!("Plain HTTP listener on {} stopped: {}", plain_addr, e),
            }
        })))
    }
}

async fn handle_session<T: TlsService>(
    session: Session<TcpStream>,
    acceptor: TlsAcceptor,
    service: Arc<T>,
    handshake_timeout: Option<Duration>,
) {
    let peer = session.peer_addr();
    let stream = match session.negotiate().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Connection from {} finished: {}", peer, e);
            return;
        }
    };

    let handshake = acceptor.accept(stream);
    let accepted = match handshake_timeout {
        Some(limit) => match tokio::time::timeout(limit, handshake).await {
            Ok(accepted) => accepted,
            Err(_) => {
                debug!("TLS handshake with {} timed out", peer);
                return;
            }
        },
        None => handshake.await,
    };

    match accepted {
        Ok(tls) => {
            if let Err(e) = service.serve(tls, peer).await {
                debug!("TLS session with {} ended: {}", peer, e);
            }
        }
        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
    }
}
