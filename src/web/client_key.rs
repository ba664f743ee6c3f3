//! Client key extraction from HTTP requests.

use std::net::SocketAddr;

use http::HeaderMap;

/// Proxy header carrying the original client and any intermediate proxies.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Proxy header carrying a single client address.
pub const X_REAL_IP: &str = "x-real-ip";

/// Derive the rate limiting key for a request.
///
/// Precedence:
/// 1. the first entry of `X-Forwarded-For`,
/// 2. `X-Real-IP`,
/// 3. the IP of the connection peer.
///
/// Blank or non-UTF-8 header values are skipped. Returns `None` when no
/// signal is available.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(first) = header_str(headers, X_FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }

    if let Some(real_ip) = header_str(headers, X_REAL_IP)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(real_ip.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
