//! Pluggable name resolution.
//!
//! The client resolves through a [`Resolve`] implementation so callers can
//! inject their own resolver; the default delegates to the system
//! `getaddrinfo` on the blocking thread pool.

use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;

use crate::error::BoxError;

/// Host/port pair to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    host: String,
    port: u16,
}

impl Name {
    pub fn new(host: impl Into<String>, port: u16) -> Name {
        Name {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

pub type Resolving =
    Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, BoxError>> + Send + 'static>>;

/// Trait for customizing DNS resolution.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

pub(crate) type DynResolver = Arc<dyn Resolve>;

/// System resolver via `getaddrinfo`.
#[derive(Debug, Default)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let target = (name.host.clone(), name.port);
            let addrs = tokio::task::spawn_blocking(move || target.to_socket_addrs())
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .map_err(|e| Box::new(e) as BoxError)?
                .collect::<Vec<_>>();
            if addrs.is_empty() {
                return Err(format!("no addresses found for {}", name.host).into());
            }
            Ok(addrs)
        })
    }
}
