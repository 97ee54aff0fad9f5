//! HTTPS Port Guard - CLI Entry Point
//!
//! Serves a small HTTPS endpoint and redirects plaintext HTTP that reaches
//! the same port.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use https_port_guard::config::TlsConfig;
use https_port_guard::inbound::ShutdownSignal;
use https_port_guard::{Config, Error, Server, TlsService, TlsStream, VERSION};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "https-port-guard")]
#[command(version = VERSION)]
#[command(about = "TLS listener that redirects plaintext HTTP sent to the HTTPS port")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// PEM certificate chain (overrides config)
    #[arg(long = "cert")]
    cert: Option<String>,

    /// PEM private key (overrides config)
    #[arg(long = "key")]
    key: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

/// HTTPS side of the demo: HTTP/1.1 or h2 via hyper.
struct HelloService {
    shutdown: Arc<ShutdownSignal>,
}

#[async_trait]
impl TlsService for HelloService {
    async fn serve(&self, stream: TlsStream, peer: SocketAddr) -> https_port_guard::Result<()> {
        let service = service_fn(move |req: Request<Incoming>| async move {
            let body = format!("Hello over HTTPS, {} {}\n", req.method(), req.uri().path());
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
        });

        let builder = Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        // Finish in-flight requests, then close keep-alive connections
        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        result.map_err(|e| Error::connection(format!("HTTPS {}: {}", peer, e)))
    }
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("guard-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_async(path).await?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    match (args.cert, args.key) {
        (Some(cert), Some(key)) => config.tls = Some(TlsConfig { cert, key }),
        (None, None) => {}
        _ => anyhow::bail!("--cert and --key must be given together"),
    }
    config.validate()?;

    init_logging(&config.log_level, args.log_json)?;
    info!("HTTPS Port Guard v{}", VERSION);

    // Test mode
    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let server = Arc::new(Server::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    let service = Arc::new(HelloService {
        shutdown: server.shutdown_signal(),
    });
    match server.listen_and_serve_tls(service).await {
        Err(Error::ServerClosed) => {
            info!("Server stopped");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("https_port_guard={}", level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}
