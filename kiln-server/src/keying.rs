//! Client identity keying.
//!
//! Sessions are keyed (and requests logged) by the network prefix of the
//! client address, never the raw address: /24 for IPv4, /64 for IPv6.
//! Masking is deterministic, so the key is stable across a client's
//! requests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::http::HeaderMap;

use crate::error::ApiError;

/// Pick the address to key on: the first `X-Forwarded-For` entry when
/// running behind a proxy, otherwise the socket peer.
pub fn client_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Mask a raw address string into its subnet key.
pub fn mask_addr(raw: &str) -> Result<String, ApiError> {
    let addr: IpAddr = raw.trim().parse().map_err(|_| ApiError::InvalidAddress)?;
    Ok(mask_ip(addr))
}

/// Zero the host bits of an address, keeping the /24 (v4) or /64 (v6)
/// network prefix.
pub fn mask_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => Ipv4Addr::from(u32::from(v4) & 0xffff_ff00).to_string(),
        IpAddr::V6(v6) => Ipv6Addr::from(u128::from(v6) & (u128::MAX << 64)).to_string(),
    }
}
