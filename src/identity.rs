// Client identity used to scope rate-limit counters.
//
// The key is a pure function of the client IP and an optional fingerprint,
// so every instance behind the same store derives the same key for the same
// caller. The forwarded-for header is taken at face value: deployments
// without a trusted reverse proxy must strip it upstream.

use sha1::{Digest, Sha1};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Number of hex characters of the fingerprint digest kept in the key.
const FINGERPRINT_HASH_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection metadata the resolver needs from a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Raw first hop of `X-Forwarded-For`, if the header was present.
    pub forwarded_for: Option<String>,
    /// Address of the TCP peer, if known.
    pub peer: Option<SocketAddr>,
    /// Fingerprint sent as a header; a body-supplied one takes precedence.
    pub header_fingerprint: Option<String>,
}

/// Derives the rate-limit key for a request.
pub fn resolve(meta: &RequestMetadata, fingerprint: Option<&str>) -> ClientKey {
    let ip = client_ip(meta);
    let fingerprint = fingerprint
        .filter(|fp| !fp.is_empty())
        .or(meta.header_fingerprint.as_deref())
        .filter(|fp| !fp.is_empty());

    match fingerprint {
        Some(fp) => ClientKey(format!("{}:{}", ip, fingerprint_hash(fp))),
        None => ClientKey(ip),
    }
}

/// Client IP, preferring the forwarded-for first hop over the peer address.
pub fn client_ip(meta: &RequestMetadata) -> String {
    let raw = meta
        .forwarded_for
        .as_deref()
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .or_else(|| meta.peer.map(|addr| addr.ip().to_string()));

    match raw {
        Some(ip) => normalize_ip(&ip),
        None => "unknown".to_string(),
    }
}

fn normalize_ip(raw: &str) -> String {
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => raw.to_string(),
    }
}

fn fingerprint_hash(fingerprint: &str) -> String {
    let digest = Sha1::digest(fingerprint.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(FINGERPRINT_HASH_LEN);
    hex
}
