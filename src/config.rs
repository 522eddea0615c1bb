//! Client configuration.
//!
//! Plain structs with defaults, validated once at client construction.
//! Environment variables (`HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY`,
//! `NO_PROXY`, `SSL_CERT_FILE`, `SSL_CERT_DIR`) are read only here.

use std::time::Duration;

use crate::error::{self, Result};
use crate::proxy::Proxy;
use crate::tls::TlsConfig;

/// Top-level configuration consumed by [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub keepalive: KeepaliveConfig,
    pub tls: TlsConfig,
    pub protocols: ProtocolConfig,
    /// Explicit proxies. When empty and `proxies_from_env` is set, the
    /// standard environment variables are consulted instead.
    pub proxies: Vec<Proxy>,
    pub proxies_from_env: bool,
    /// Value for the `User-Agent` header when the request has none.
    pub user_agent: Option<String>,
}

/// Pool sizing and blocking behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on per-origin pools. The least-recently-used pool with no
    /// remaining connections is evicted when exceeded.
    pub num_pools: usize,
    /// Maximum connections per origin (idle + active).
    pub max_per_origin: usize,
    /// Maximum idle HTTP/1 connections kept per origin.
    pub max_idle_per_origin: usize,
    /// When the pool is full: wait for a release (true) or fail fast with
    /// a pool-full error (false).
    pub block_if_full: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_pools: 10,
            max_per_origin: 10,
            max_idle_per_origin: 10,
            block_if_full: true,
        }
    }
}

/// Deadlines applied per attempt; `total` spans all retries of one call.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
    /// Wall-clock deadline covering every attempt of a single `request`
    /// call. `None` means per-attempt deadlines only.
    pub total: Option<Duration>,
    /// How long to wait for `100 Continue` before sending the body anyway.
    pub expect_continue: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            total: None,
            expect_continue: Duration::from_secs(1),
        }
    }
}

/// Liveness probing of idle multiplexed connections.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Silence on an idle connection before a PING is sent. Clamped to a
    /// minimum of one second; thirty seconds or more is recommended.
    pub idle_window: Duration,
    /// Total duration after which pinging stops. The connection then stays
    /// acquirable without liveness verification until traffic resumes or
    /// it is retired; the first request after a silent partition may be
    /// burned discovering the loss.
    pub delay: Duration,
    /// Keep pinging past `delay` instead of entering the best-effort
    /// phase described above.
    pub ping_forever: bool,
    /// Retire a connection outright once it has been open this long.
    pub max_lifetime: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(30),
            delay: Duration::from_secs(300),
            ping_forever: false,
            max_lifetime: None,
        }
    }
}

impl KeepaliveConfig {
    pub(crate) fn effective_idle_window(&self) -> Duration {
        self.idle_window.max(Duration::from_secs(1))
    }
}

/// Which protocols may be negotiated. HTTP/1.1 cannot be disabled.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub enable_http2: bool,
    pub enable_http3: bool,
    /// Attempt QUIC first for `https` origins, falling back to TCP when
    /// the QUIC connect fails.
    pub prefer_http3: bool,
    /// Streams per multiplexed connection assumed until the peer's
    /// settings arrive.
    pub default_max_streams: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enable_http2: true,
            enable_http3: false,
            prefer_http3: false,
            default_max_streams: 100,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            keepalive: KeepaliveConfig::default(),
            tls: TlsConfig::default(),
            protocols: ProtocolConfig::default(),
            proxies: Vec::new(),
            proxies_from_env: true,
            user_agent: Some(concat!("weft/", env!("CARGO_PKG_VERSION")).to_owned()),
        }
    }
}

impl ClientConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.pool.num_pools == 0 {
            return Err(error::builder("pool.num_pools must be at least 1"));
        }
        if self.pool.max_per_origin == 0 {
            return Err(error::builder("pool.max_per_origin must be at least 1"));
        }
        if self.protocols.prefer_http3 && !self.protocols.enable_http3 {
            return Err(error::builder(
                "protocols.prefer_http3 requires protocols.enable_http3",
            ));
        }
        if self.protocols.default_max_streams == 0 {
            return Err(error::builder(
                "protocols.default_max_streams must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_pool() {
        let mut cfg = ClientConfig::default();
        cfg.pool.max_per_origin = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn idle_window_clamped_to_one_second() {
        let ka = KeepaliveConfig {
            idle_window: Duration::from_millis(20),
            ..KeepaliveConfig::default()
        };
        assert_eq!(ka.effective_idle_window(), Duration::from_secs(1));
    }
}
