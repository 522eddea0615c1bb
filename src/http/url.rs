//! Scheme handling and URL normalization.
//!
//! The recognized scheme set extends `http`/`https` with the WebSocket
//! schemes, including the RFC 8441 variants that request the upgrade over
//! a multiplexed connection. The `+rfc8441` schemes are rewritten to their
//! base scheme before parsing so the URL library applies its special-scheme
//! rules (host lowercasing, default-port stripping, percent-encoding).

use url::Url;

use crate::error::{self, Error, Result};

/// Recognized URL schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    WsRfc8441,
    WssRfc8441,
}

impl Scheme {
    pub(crate) fn parse(s: &str) -> Option<Scheme> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            "ws+rfc8441" => Some(Scheme::WsRfc8441),
            "wss+rfc8441" => Some(Scheme::WssRfc8441),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::WsRfc8441 => "ws+rfc8441",
            Scheme::WssRfc8441 => "wss+rfc8441",
        }
    }

    /// The scheme the URL is parsed and serialized under.
    pub(crate) fn transport(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws | Scheme::WsRfc8441 => "ws",
            Scheme::Wss | Scheme::WssRfc8441 => "wss",
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss | Scheme::WssRfc8441)
    }

    pub(crate) fn is_websocket(&self) -> bool {
        !matches!(self, Scheme::Http | Scheme::Https)
    }

    /// Whether the upgrade is requested over a multiplexed connection.
    pub(crate) fn is_rfc8441(&self) -> bool {
        matches!(self, Scheme::WsRfc8441 | Scheme::WssRfc8441)
    }

    pub(crate) fn default_port(&self) -> u16 {
        if self.is_tls() {
            443
        } else {
            80
        }
    }
}

fn bad_url(input: &str, why: impl std::fmt::Display) -> Error {
    error::builder(format!("invalid URL {input:?}: {why}"))
}

/// Parse and normalize a request target.
///
/// Returns the transport URL (scheme `http`/`https`/`ws`/`wss`) together
/// with the original scheme. Normalization is idempotent: host lowercased,
/// default port stripped, fragment removed, path percent-encoded.
pub(crate) fn parse_target(input: &str) -> Result<(Url, Scheme)> {
    let raw_scheme = input
        .split_once(':')
        .map(|(s, _)| s)
        .ok_or_else(|| bad_url(input, "missing scheme"))?;
    let scheme = Scheme::parse(&raw_scheme.to_ascii_lowercase())
        .ok_or_else(|| bad_url(input, format!("unsupported scheme {raw_scheme:?}")))?;

    let rewritten;
    let to_parse = if raw_scheme == scheme.transport() {
        input
    } else {
        rewritten = format!("{}{}", scheme.transport(), &input[raw_scheme.len()..]);
        &rewritten
    };

    let mut url = Url::parse(to_parse).map_err(|e| bad_url(input, e))?;
    if url.host_str().is_none() {
        return Err(bad_url(input, "missing host"));
    }
    url.set_fragment(None);
    Ok((url, scheme))
}

/// Effective port of a transport URL.
pub(crate) fn port_of(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(80)
}

/// The request-target sent on the wire (origin-form).
pub(crate) fn request_target(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_owned(),
    }
}

/// `host` or `host:port` for the `Host` header / `:authority`.
pub(crate) fn authority(url: &Url, scheme: Scheme) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(p) if p != scheme.default_port() => format!("{host}:{p}"),
        _ => host.to_owned(),
    }
}
