//! HTTPS redirect helpers and `Host` header manipulation
//!
//! Host strings are `hostname[:port]` where an IPv6 hostname keeps its
//! brackets, e.g. `[::1]:8443`.

use super::request::Request;
use super::response::ResponseBuilder;
use crate::config::RedirectPort;
use crate::{Error, Result};
use http::header::LOCATION;
use http::{HeaderValue, StatusCode};

/// Set `Location` and the status. No body is written.
pub fn redirect(resp: &mut ResponseBuilder, status: StatusCode, url: &str) -> Result<()> {
    let location = HeaderValue::from_str(url)
        .map_err(|_| Error::malformed(format!("invalid redirect location {:?}", url)))?;
    resp.set_header(LOCATION, location);
    resp.set_status(status);
    Ok(())
}

/// Redirect the request to the same host and path over HTTPS.
pub fn redirect_to_https(
    resp: &mut ResponseBuilder,
    req: &Request,
    status: StatusCode,
    port: RedirectPort,
) -> Result<()> {
    redirect(resp, status, &https_url(req, port))
}

/// `https://` URL for `req`, with the host adjusted per `port`.
pub fn https_url(req: &Request, port: RedirectPort) -> String {
    let host = match port {
        RedirectPort::StripDefault => req.host.strip_suffix(":80").unwrap_or(&req.host).to_string(),
        RedirectPort::ForceSamePort => {
            if split_host_port(&req.host).1.is_empty() {
                join_host_port(&req.host, "80")
            } else {
                req.host.clone()
            }
        }
        RedirectPort::Keep => req.host.clone(),
    };
    https_url_with_host(req, &host)
}

/// `https://` URL for `req` using `host` verbatim.
pub fn https_url_with_host(req: &Request, host: &str) -> String {
    let mut url = String::with_capacity(8 + host.len() + req.path.len() + req.raw_query.len() + 1);
    url.push_str("https://");
    url.push_str(host);
    url.push_str(&req.path);
    if req.force_query || !req.raw_query.is_empty() {
        url.push('?');
        url.push_str(&req.raw_query);
    }
    url
}

/// `"[::1]:5678"` -> `("[::1]", "5678")`, `"example.com"` -> `("example.com", "")`
pub fn split_host_port(host: &str) -> (&str, &str) {
    if !host.ends_with(']') {
        if let Some(i) = host.rfind(':') {
            return (&host[..i], &host[i + 1..]);
        }
    }
    (host, "")
}

pub fn hostname(host: &str) -> &str {
    split_host_port(host).0
}

pub fn port(host: &str) -> &str {
    split_host_port(host).1
}

/// Join a hostname and port, bracketing IPv6 literals.
///
/// `port` may carry a leading `:`; an empty port (or a lone `:`) yields the
/// hostname alone.
pub fn join_host_port(hostname: &str, port: &str) -> String {
    let mut out = String::with_capacity(hostname.len() + port.len() + 3);
    if hostname.contains(':') {
        if !hostname.starts_with('[') {
            out.push('[');
        }
        out.push_str(hostname);
        if !hostname.ends_with(']') {
            out.push(']');
        }
    } else {
        out.push_str(hostname);
    }

    let port = port.strip_prefix(':').unwrap_or(port);
    if !port.is_empty() {
        out.push(':');
        out.push_str(port);
    }
    out
}

/// `"[::1]:5678", "localhost"` -> `"localhost:5678"`
pub fn replace_hostname(host: &str, name: &str) -> String {
    join_host_port(name, port(host))
}

/// `"[::1]:5678", "7890"` -> `"[::1]:7890"`
pub fn replace_port(host: &str, new_port: &str) -> String {
    join_host_port(hostname(host), new_port)
}

/// `"[::1]"` -> `"::1"`
pub fn strip_ipv6_brackets(v6: &str) -> &str {
    let v6 = v6.strip_prefix('[').unwrap_or(v6);
    v6.strip_suffix(']').unwrap_or(v6)
}
