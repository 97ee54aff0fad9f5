//! Minimal HTTP/1.1 response writer for plaintext clients on the TLS port
//!
//! The whole response is buffered and written in one go by [`ResponseBuilder::flush`].

use super::request::has_connection_token;
use crate::Result;
use http::header::{IntoHeaderName, CONNECTION, CONTENT_LENGTH, DATE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffered response with write-once status and header locking.
#[derive(Debug)]
pub struct ResponseBuilder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
    header_locked: bool,
    content_length: bool,
    close: bool,
    omit_body: bool,
    flushed: bool,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(date) = HeaderValue::from_str(&http_date()) {
            headers.insert(DATE, date);
        }
        ResponseBuilder {
            status: None,
            headers,
            body: Vec::new(),
            header_locked: false,
            content_length: true,
            close: false,
            omit_body: false,
            flushed: false,
        }
    }

    /// Status that will be written; 200 when never set.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Set the status and lock the headers. Only the first call has effect.
    pub fn set_status(&mut self, status: StatusCode) {
        if !self.header_locked {
            self.status = Some(status);
            self.header_locked = true;
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replace a header. Ignored once the headers are locked.
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) -> bool {
        if self.header_locked {
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    /// Add a header value without replacing existing ones. Ignored once locked.
    pub fn append_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) -> bool {
        if self.header_locked {
            return false;
        }
        self.headers.append(name, value);
        true
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        if self.header_locked {
            return false;
        }
        self.headers.remove(name).is_some()
    }

    pub(crate) fn force_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn is_header_locked(&self) -> bool {
        self.header_locked
    }

    /// Append to the body. The first write locks the headers.
    pub fn write(&mut self, data: &[u8]) {
        self.lock_header();
        self.body.extend_from_slice(data);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Omit `Content-Length`; the connection is closed after the response.
    pub fn disable_content_length(&mut self) {
        self.content_length = false;
        self.close = true;
    }

    /// Send `Connection: close` and end the session after this response.
    pub fn force_close(&mut self) {
        self.close = true;
    }

    /// Keep `Content-Length` but do not send body bytes (HEAD).
    pub fn omit_body(&mut self) {
        self.omit_body = true;
    }

    pub fn keep_alive(&self) -> bool {
        !self.close && !has_connection_token(&self.headers, "close")
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn lock_header(&mut self) {
        if !self.header_locked {
            self.header_locked = true;
            if self.status.is_none() {
                self.status = Some(StatusCode::OK);
            }
        }
    }

    /// Serialize status line, headers and body.
    pub fn encode(&self) -> Vec<u8> {
        let status = self.status();
        let mut out = Vec::with_capacity(128 + self.headers.len() * 32 + self.body.len());

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
        out.extend_from_slice(b"\r\n");

        match self.headers.get(DATE) {
            Some(date) => write_header_line(&mut out, DATE.as_str(), date),
            None => {
                if let Ok(date) = HeaderValue::from_str(&http_date()) {
                    write_header_line(&mut out, DATE.as_str(), &date);
                }
            }
        }
        for (name, value) in self.headers.iter() {
            if name == DATE || name == CONNECTION || name == CONTENT_LENGTH {
                continue;
            }
            write_header_line(&mut out, name.as_str(), value);
        }

        if self.close {
            write_header_line(&mut out, CONNECTION.as_str(), &HeaderValue::from_static("close"));
        } else {
            for value in self.headers.get_all(CONNECTION) {
                write_header_line(&mut out, CONNECTION.as_str(), value);
            }
        }

        if self.content_length {
            let len = HeaderValue::from(self.body.len());
            write_header_line(&mut out, CONTENT_LENGTH.as_str(), &len);
        }

        out.extend_from_slice(b"\r\n");
        if !self.omit_body {
            out.extend_from_slice(&self.body);
        }
        out
    }

    /// Write the response to `w`. Only the first call writes anything.
    pub async fn flush<W>(&mut self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        self.lock_header();

        let wire = self.encode();
        w.write_all(&wire).await?;
        w.flush().await?;
        Ok(())
    }
}

fn write_header_line(out: &mut Vec<u8>, name: &str, value: &HeaderValue) {
    out.extend_from_slice(canonical_header_name(name).as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `content-type` -> `Content-Type`
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// Current time in RFC 1123 format, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
