//! HTTP/1.x request-head parsing over a [`BoundedReader`]

use super::bounded::BoundedReader;
use crate::{Error, Result};
use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use httparse::{Request as HttpRequest, Status as HttpStatus, EMPTY_HEADER};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4 * 1024;

/// Parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as sent
    pub target: String,
    /// Path component, still percent-encoded
    pub path: String,
    /// Query without the leading `?`
    pub raw_query: String,
    /// Target ended in a bare `?`
    pub force_query: bool,
    /// Authority from an absolute-form target, else the Host header
    pub host: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    /// Client asked for the connection to end after this exchange
    pub wants_close: bool,
    /// Size of the head including the terminating blank line
    pub head_len: usize,
}

impl Request {
    /// Path plus query, as it would appear in an origin-form target.
    pub fn request_uri(&self) -> String {
        let mut uri = self.path.clone();
        if self.force_query || !self.raw_query.is_empty() {
            uri.push('?');
            uri.push_str(&self.raw_query);
        }
        uri
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Read one request head.
///
/// Returns `Ok(None)` when the peer closes before sending any byte. The
/// head (request line through the blank line) may be at most
/// `max_header_bytes` long; bytes read past the head are pushed back into
/// `reader` for the body or the next request.
///
/// Each byte is scanned for the blank line once; the head is parsed only
/// when a terminator has been seen.
pub async fn read_request_head<S>(
    reader: &mut BoundedReader<S>,
    max_header_bytes: usize,
) -> Result<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK.min(max_header_bytes.max(1)));
    let mut scanned = 0;

    loop {
        while let Some(end) = find_head_end(&buf, &mut scanned) {
            // None here means only leading blank lines so far
            if let Some(req) = parse_head(&buf[..end])? {
                if req.head_len > max_header_bytes {
                    return Err(Error::HeaderTooLarge);
                }
                reader.unread(&buf[req.head_len..]);
                return Ok(Some(req));
            }
        }
        if buf.len() > max_header_bytes {
            return Err(Error::HeaderTooLarge);
        }

        buf.reserve(READ_CHUNK);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if reader.budget_exhausted() {
                return Err(Error::HeaderTooLarge);
            }
            if buf.is_empty() {
                return Ok(None);
            }
            parse_head(&buf)?;
            return Err(Error::malformed("unexpected EOF in request head"));
        }
    }
}

/// Find the end of the next blank line (`\n\n` or `\n\r\n`) at or after
/// `*from`, advancing `*from` so later calls skip bytes already checked.
fn find_head_end(buf: &[u8], from: &mut usize) -> Option<usize> {
    let mut i = *from;
    while let Some(pos) = buf[i..].iter().position(|&b| b == b'\n') {
        let nl = i + pos;
        match (buf.get(nl + 1).copied(), buf.get(nl + 2).copied()) {
            (Some(b'\n'), _) => {
                *from = nl + 2;
                return Some(nl + 2);
            }
            (Some(b'\r'), Some(b'\n')) => {
                *from = nl + 3;
                return Some(nl + 3);
            }
            (None, _) | (Some(b'\r'), None) => {
                *from = nl;
                return None;
            }
            _ => i = nl + 1,
        }
    }
    *from = buf.len();
    None
}

/// Parse a complete head from `buf`, or `None` if more bytes are needed.
///
/// The number of header fields is limited only by the size of `buf`.
pub fn parse_head(buf: &[u8]) -> Result<Option<Request>> {
    let lines = buf.iter().filter(|&&b| b == b'\n').count();
    let mut headers_buf = vec![EMPTY_HEADER; lines.max(1)];
    let mut req = HttpRequest::new(&mut headers_buf);
    let head_len = match req.parse(buf) {
        Ok(HttpStatus::Complete(len)) => len,
        Ok(HttpStatus::Partial) => return Ok(None),
        Err(e) => return Err(Error::malformed(e.to_string())),
    };

    let method = req
        .method
        .ok_or_else(|| Error::malformed("missing method"))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::malformed(format!("invalid method {:?}", method)))?;
    let target = req
        .path
        .ok_or_else(|| Error::malformed("missing request target"))?
        .to_string();
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::malformed("unsupported HTTP version")),
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Error::malformed(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Error::malformed(format!("invalid value for header {}", h.name)))?;
        headers.append(name, value);
    }

    let parsed = parse_target(&method, &target)?;

    let mut host_values = headers.get_all(HOST).iter();
    let host_header = host_values.next();
    if host_values.next().is_some() {
        return Err(Error::malformed("too many Host headers"));
    }
    let host = match parsed.authority {
        Some(authority) => authority,
        None => match host_header {
            Some(v) => v
                .to_str()
                .map_err(|_| Error::malformed("invalid Host header"))?
                .trim()
                .to_string(),
            None => String::new(),
        },
    };

    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if headers.contains_key(TRANSFER_ENCODING) && !chunked {
        return Err(Error::malformed("unsupported transfer encoding"));
    }

    let content_length = if chunked {
        None
    } else {
        parse_content_length(&headers)?
    };

    let wants_close = match version {
        Version::HTTP_10 => !has_connection_token(&headers, "keep-alive"),
        _ => has_connection_token(&headers, "close"),
    };

    Ok(Some(Request {
        method,
        target,
        path: parsed.path,
        raw_query: parsed.raw_query,
        force_query: parsed.force_query,
        host,
        version,
        headers,
        content_length,
        chunked,
        wants_close,
        head_len,
    }))
}

struct Target {
    path: String,
    raw_query: String,
    force_query: bool,
    authority: Option<String>,
}

fn parse_target(method: &Method, target: &str) -> Result<Target> {
    if target == "*" {
        return Ok(Target {
            path: "*".to_string(),
            raw_query: String::new(),
            force_query: false,
            authority: None,
        });
    }

    if target.starts_with('/') {
        let (path, raw_query, force_query) = split_query(target);
        return Ok(Target {
            path: path.to_string(),
            raw_query: raw_query.to_string(),
            force_query,
            authority: None,
        });
    }

    if *method == Method::CONNECT {
        return Ok(Target {
            path: String::new(),
            raw_query: String::new(),
            force_query: false,
            authority: Some(target.to_string()),
        });
    }

    let uri: Uri = target
        .parse()
        .map_err(|_| Error::malformed(format!("invalid request target {:?}", target)))?;
    let authority = match (uri.scheme(), uri.authority()) {
        (Some(_), Some(authority)) => authority.as_str().to_string(),
        _ => {
            return Err(Error::malformed(format!(
                "invalid request target {:?}",
                target
            )))
        }
    };

    // `Uri` reports "/" for an empty path, so split the raw text instead.
    let rest = target
        .find("://")
        .map(|i| &target[i + 3..])
        .and_then(|after| after.find(|c: char| c == '/' || c == '?').map(|j| &after[j..]))
        .unwrap_or("");
    let (path, raw_query, force_query) = split_query(rest);

    Ok(Target {
        path: path.to_string(),
        raw_query: raw_query.to_string(),
        force_query,
        authority: Some(authority),
    })
}

fn split_query(s: &str) -> (&str, &str, bool) {
    match s.split_once('?') {
        Some((path, query)) => (path, query, query.is_empty()),
        None => (s, "", false),
    }
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::malformed("invalid Content-Length"))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(Error::malformed("conflicting Content-Length headers"))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
