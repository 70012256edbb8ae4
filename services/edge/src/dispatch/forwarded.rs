//! Outbound request rewriting and forwarding headers.

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{CONNECTION, HOST};
use axum::http::uri::Scheme;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};

use super::upstream::UpstreamError;

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Scheme of the local port a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundScheme {
    Http,
    Https,
}

impl InboundScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Split a Host header value into hostname and optional port.
pub fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return match rest.split_once(']') {
            Some((ip, tail)) => (ip, tail.strip_prefix(':')),
            None => (host, None),
        };
    }
    match host.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite an inbound request so it can be sent to `target` over TLS.
///
/// The URL authority becomes `target` and the scheme becomes `https`. The
/// inbound `Host` header is kept so backends can tell sites apart;
/// `X-Forwarded-Host`, `X-Forwarded-Proto` and `X-Forwarded-For` describe
/// the original request.
pub fn prepare_forward(
    request: Request<Body>,
    target: &str,
    original_host: &str,
) -> Result<Request<Body>, UpstreamError> {
    let (mut parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(target)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

    let scheme = parts
        .extensions
        .get::<InboundScheme>()
        .copied()
        .unwrap_or(InboundScheme::Https);
    let client = parts.extensions.get::<ClientAddr>().copied();

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);

    if !original_host.is_empty() {
        if let Ok(value) = HeaderValue::from_str(original_host) {
            if !headers.contains_key(HOST) {
                headers.insert(HOST, value.clone());
            }
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    if let Some(ClientAddr(addr)) = client {
        let ip = addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    Ok(Request::from_parts(parts, body))
}
