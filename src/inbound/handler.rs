//! Request/response loop for plaintext HTTP that arrived on the TLS port

use super::bounded::BoundedReader;
use super::listener::ShutdownSignal;
use super::redirect::redirect_to_https;
use super::request::{read_request_head, Request};
use super::response::ResponseBuilder;
use crate::common::{Phase, TimedStream, TimeoutPolicy};
use crate::config::{Config, RedirectPort};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use http::header::{HeaderName, CONNECTION};
use http::{HeaderValue, Method, StatusCode, Version};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Take};
use tracing::{debug, error, warn};

/// Unread request body left after the handler that is still drained to
/// keep the connection usable (256 KiB).
pub const MAX_DRAIN_BYTES: u64 = 256 * 1024;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Custom handler for plaintext requests.
///
/// When none is installed every request is redirected to HTTPS.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn serve(&self, req: &Request, body: &mut RequestBody<'_>, resp: &mut ResponseBuilder);
}

/// Request body limited to its `Content-Length`.
pub struct RequestBody<'a> {
    inner: Take<&'a mut (dyn AsyncRead + Unpin + Send)>,
}

impl<'a> RequestBody<'a> {
    pub fn new(reader: &'a mut (dyn AsyncRead + Unpin + Send), len: u64) -> Self {
        RequestBody {
            inner: tokio::io::AsyncReadExt::take(reader, len),
        }
    }

    /// Body bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    /// Discard the rest of the body if it is at most `max` bytes.
    ///
    /// Returns `true` when the whole body has been consumed.
    pub async fn drain(&mut self, max: u64) -> io::Result<bool> {
        if self.remaining() == 0 {
            return Ok(true);
        }
        if self.remaining() > max {
            return Ok(false);
        }
        tokio::io::copy(&mut self.inner, &mut tokio::io::sink()).await?;
        Ok(self.remaining() == 0)
    }
}

impl AsyncRead for RequestBody<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Serves plaintext HTTP sessions: read a bounded head, answer, repeat
/// while the response allows keep-alive.
pub struct RequestHandler {
    max_header_bytes: usize,
    timeouts: TimeoutPolicy,
    redirect_status: StatusCode,
    redirect_port: RedirectPort,
    handler: Option<Arc<dyn HttpHandler>>,
    shutdown: Arc<ShutdownSignal>,
}

impl RequestHandler {
    pub fn new(config: &Config, shutdown: Arc<ShutdownSignal>) -> Self {
        install_panic_backtrace_hook();
        RequestHandler {
            max_header_bytes: config.effective_max_header_bytes(),
            timeouts: config.timeouts(),
            redirect_status: StatusCode::from_u16(config.redirect_status_code)
                .unwrap_or(StatusCode::TEMPORARY_REDIRECT),
            redirect_port: config.redirect_port,
            handler: None,
            shutdown,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// Run the session until the connection should be closed.
    ///
    /// `pending` holds bytes already read from `stream` (the sniffed
    /// prefix); they count against the first request's header budget.
    /// `Ok(())` means the session ended normally (close requested, peer
    /// gone, shutdown); errors are the reason the connection was dropped.
    pub async fn serve<S>(
        &self,
        stream: TimedStream<S>,
        pending: BytesMut,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BoundedReader::new(stream);
        reader.unread(&pending);
        let mut served = 0u64;

        loop {
            if served > 0 {
                if self.shutdown.is_shutting_down() {
                    return Ok(());
                }
                reader
                    .get_mut()
                    .set_read_deadline(self.timeouts.deadline(Phase::Idle));
                let more = tokio::select! {
                    more = reader.fill_buf() => more?,
                    _ = self.shutdown.cancelled() => {
                        debug!("HTTP {} idle connection closed for shutdown", peer);
                        return Ok(());
                    }
                };
                if !more {
                    return Ok(());
                }
            }

            reader.set_header_mode(self.max_header_bytes.saturating_sub(reader.buffered()));
            reader
                .get_mut()
                .set_read_deadline(self.timeouts.deadline(Phase::Header));

            let req = match read_request_head(&mut reader, self.max_header_bytes).await {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!("HTTP {} read request failed: {}", peer, e);
                    return Err(e);
                }
            };
            served += 1;
            debug!(
                "HTTP {} {} {} host={:?} on TLS port",
                peer, req.method, req.target, req.host
            );

            let mut resp = ResponseBuilder::new();
            if req.method == Method::HEAD {
                resp.omit_body();
            }

            if req.host.is_empty() {
                resp.force_close();
                resp.set_status(StatusCode::BAD_REQUEST);
                resp.write_str("missing required Host header");
                self.write_response(&mut reader, &mut resp, peer).await?;
                return Err(Error::MissingHost);
            }

            reader.set_body_mode();
            reader
                .get_mut()
                .set_read_deadline(self.timeouts.deadline(Phase::Body));
            let body_len = if req.chunked {
                0
            } else {
                req.content_length.unwrap_or(0)
            };

            let body_consumed = {
                let mut body = RequestBody::new(&mut reader, body_len);
                self.dispatch(&req, &mut body, &mut resp, peer).await?;
                match body.drain(MAX_DRAIN_BYTES).await {
                    Ok(done) => done,
                    Err(e) => {
                        debug!("HTTP {} drain request body failed: {}", peer, e);
                        false
                    }
                }
            };
            reader.get_mut().set_read_deadline(None);

            if req.wants_close || req.chunked || !body_consumed {
                resp.force_close();
            }
            // HTTP/1.0 clients close unless keep-alive is confirmed
            if req.version == Version::HTTP_10
                && resp.keep_alive()
                && !resp.headers().contains_key(CONNECTION)
            {
                resp.force_header(CONNECTION, HeaderValue::from_static("keep-alive"));
            }
            self.add_keep_alive_timeout(&mut resp);

            self.write_response(&mut reader, &mut resp, peer).await?;
            if !resp.keep_alive() {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        req: &Request,
        body: &mut RequestBody<'_>,
        resp: &mut ResponseBuilder,
        peer: SocketAddr,
    ) -> Result<()> {
        let Some(handler) = &self.handler else {
            if redirect_to_https(resp, req, self.redirect_status, self.redirect_port).is_err() {
                resp.set_status(StatusCode::BAD_REQUEST);
            }
            resp.force_close();
            return Ok(());
        };

        match AssertUnwindSafe(handler.serve(req, body, resp))
            .catch_unwind()
            .await
        {
            Ok(()) => Ok(()),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                let backtrace = take_panic_backtrace()
                    .map(|bt| bt.to_string())
                    .unwrap_or_else(|| "<no backtrace>".to_string());
                error!(
                    "HTTP {} handler panicked serving {}: {}\n{}",
                    peer, req.target, msg, backtrace
                );
                Err(Error::HandlerPanic(msg))
            }
        }
    }

    fn add_keep_alive_timeout(&self, resp: &mut ResponseBuilder) {
        let Some(idle) = self.timeouts.idle else {
            return;
        };
        let explicit_keep_alive = resp
            .header("connection")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"));
        if resp.keep_alive() && explicit_keep_alive && !resp.headers().contains_key(KEEP_ALIVE) {
            if let Ok(value) = HeaderValue::from_str(&format!("timeout={}", idle.as_secs())) {
                resp.force_header(KEEP_ALIVE, value);
            }
        }
    }

    async fn write_response<S>(
        &self,
        reader: &mut BoundedReader<TimedStream<S>>,
        resp: &mut ResponseBuilder,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let stream = reader.get_mut();
        stream.set_write_deadline(self.timeouts.deadline(Phase::Write));
        let result = resp.flush(stream).await;
        stream.set_write_deadline(None);
        if let Err(e) = &result {
            warn!("HTTP {} write response failed: {}", peer, e);
        }
        result
    }
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the panicking thread's backtrace so the
/// catch site can log it. Installed once per process.
fn install_panic_backtrace_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

/// Backtrace of the last panic on this thread, if the hook recorded one.
fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl HttpHandler for Echo {
        async fn serve(&self, req: &Request, body: &mut RequestBody<'_>, resp: &mut ResponseBuilder) {
            match req.path.as_str() {
                "/bye" => {
                    resp.set_header(CONNECTION, HeaderValue::from_static("close"));
                }
                "/stay" => {
                    resp.set_header(CONNECTION, HeaderValue::from_static("keep-alive"));
                }
                "/panic" => panic!("boom"),
                "/echo" => {
                    let mut data = Vec::new();
                    body.read_to_end(&mut data).await.unwrap();
                    resp.write(&data);
                    return;
                }
                _ => {}
            }
            resp.write_str(&req.path);
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn redirecting(config: &Config) -> RequestHandler {
        RequestHandler::new(config, Arc::new(ShutdownSignal::new()))
    }

    fn echoing(config: &Config) -> RequestHandler {
        redirecting(config).with_handler(Arc::new(Echo))
    }

    async fn exchange(handler: &RequestHandler, input: &[u8]) -> (Result<()>, String) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let result = handler
            .serve(TimedStream::new(server), BytesMut::new(), peer())
            .await;
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        (result, out)
    }

    #[tokio::test]
    async fn test_default_redirect_closes() {
        let handler = redirecting(&Config::default());
        let (result, out) = exchange(
            &handler,
            b"GET /a?b=c HTTP/1.1\r\nHost: example.com\r\n\r\nGET /second HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert!(out.starts_with("HTTP/1.1 307 Temporary Redirect\r\nDate: "));
        assert!(out.contains("\r\nLocation: https://example.com/a?b=c\r\n"));
        assert!(out.ends_with("Connection: close\r\nContent-Length: 0\r\n\r\n"));
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    }

    #[tokio::test]
    async fn test_configured_redirect_status() {
        let config = Config::from_str("redirect-status-code: 301").unwrap();
        let (_, out) = exchange(&redirecting(&config), b"GET / HTTP/1.1\r\nHost: h:80\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(out.contains("\r\nLocation: https://h/\r\n"));
    }

    #[tokio::test]
    async fn test_missing_host_gets_400() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(
            &handler,
            b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .await;

        assert!(matches!(result, Err(Error::MissingHost)));
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("\r\nConnection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nmissing required Host header"));
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_until_close() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(
            &handler,
            b"GET /one HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /two HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /bye HTTP/1.1\r\nHost: h\r\n\r\n\
              GET /never HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 3);
        assert!(out.contains("\r\n\r\n/one"));
        assert!(out.contains("\r\n\r\n/two"));
        assert!(out.contains("Connection: close\r\nContent-Length: 4\r\n\r\n/bye"));
        assert!(!out.contains("/never"));
    }

    #[tokio::test]
    async fn test_http10_closes_by_default() {
        let handler = echoing(&Config::default());
        let (_, out) = exchange(
            &handler,
            b"GET /a HTTP/1.0\r\nHost: h\r\n\r\nGET /b HTTP/1.0\r\nHost: h\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 1);
        assert!(out.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_http10_keep_alive_is_confirmed() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(
            &handler,
            b"GET /a HTTP/1.0\r\nHost: h\r\nConnection: keep-alive\r\n\r\n\
              GET /b HTTP/1.0\r\nHost: h\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(out.contains("Connection: keep-alive\r\nContent-Length: 2\r\n\r\n/a"));
        assert!(out.ends_with("Connection: close\r\nContent-Length: 2\r\n\r\n/b"));
    }

    #[tokio::test]
    async fn test_body_read_and_drained() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(
            &handler,
            b"POST /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello\
              POST /skip HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabc\
              GET /last HTTP/1.1\r\nHost: h\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert!(out.contains("Content-Length: 5\r\n\r\nhello"));
        assert!(out.contains("\r\n\r\n/skip"));
        assert!(out.ends_with("\r\n\r\n/last"));
    }

    #[tokio::test]
    async fn test_chunked_request_closes() {
        let handler = echoing(&Config::default());
        let (_, out) = exchange(
            &handler,
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
        assert!(out.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_no_response() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(&handler, b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").await;
        assert!(matches!(result, Err(Error::MalformedRequest(_))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_header_budget_applies_per_request() {
        let first = b"GET /one HTTP/1.1\r\nHost: h\r\n\r\n";
        let config = Config::from_str(&format!("max-header-bytes: {}", first.len())).unwrap();
        let handler = echoing(&config);

        let mut input = Vec::new();
        input.extend_from_slice(first);
        input.extend_from_slice(b"GET /two HTTP/1.1\r\nHost: h\r\n\r\n");
        input.extend_from_slice(b"GET /three HTTP/1.1\r\nHost: h\r\n\r\n");
        let (result, out) = exchange(&handler, &input).await;

        assert!(matches!(result, Err(Error::HeaderTooLarge)));
        assert!(out.contains("/one"));
        assert!(out.contains("/two"));
        assert!(!out.contains("/three"));
    }

    #[tokio::test]
    async fn test_handler_panic_closes_without_response() {
        let handler = echoing(&Config::default());
        let (result, out) = exchange(&handler, b"GET /panic HTTP/1.1\r\nHost: h\r\n\r\n").await;
        match result {
            Err(Error::HandlerPanic(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_panic_hook_records_backtrace() {
        install_panic_backtrace_hook();
        let caught = std::panic::catch_unwind(|| panic!("recorded"));
        assert!(caught.is_err());
        assert!(take_panic_backtrace().is_some());
        assert!(take_panic_backtrace().is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_timeout_header() {
        let config = Config::from_str("idle-timeout-ms: 60000").unwrap();
        let handler = echoing(&config);
        let (_, out) = exchange(&handler, b"GET /stay HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(out.contains("\r\nKeep-Alive: timeout=60\r\n"));
        assert!(out.contains("\r\nConnection: keep-alive\r\n"));

        let (_, out) = exchange(&handler, b"GET /plain HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(!out.contains("Keep-Alive"));
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let handler = echoing(&Config::default());
        let (_, out) = exchange(&handler, b"HEAD /abc HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(out.ends_with("Content-Length: 4\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_sniffed_prefix_is_replayed() {
        let handler = redirecting(&Config::default());
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"t.com/x HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let result = handler
            .serve(TimedStream::new(server), BytesMut::from(&b"GET http://hos"[..]), peer())
            .await;
        assert!(result.is_ok());

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.contains("\r\nLocation: https://host.com/x\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_session() {
        let config = Config::from_str("idle-timeout-ms: 1000").unwrap();
        let handler = echoing(&config);
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"GET /one HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

        let result = handler
            .serve(TimedStream::new(server), BytesMut::new(), peer())
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let handler = Arc::new(
            RequestHandler::new(&Config::default(), shutdown.clone()).with_handler(Arc::new(Echo)),
        );
        let (mut client, server) = tokio::io::duplex(4096);

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .serve(TimedStream::new(server), BytesMut::new(), peer())
                    .await
            })
        };

        client.write_all(b"GET /one HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        let mut seen = Vec::new();
        while !seen.ends_with(b"/one") {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
