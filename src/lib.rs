//! # weft
//!
//! A pooled, multi-origin HTTP client speaking HTTP/1.1, HTTP/2 and
//! HTTP/3 behind one protocol-agnostic request/response surface, with
//! automatic retries, redirect handling, TLS verification and
//! opportunistic WebSocket upgrade (RFC 8441 on multiplexed connections).
//!
//! ## Usage
//!
//! ```no_run
//! use weft::{Client, RequestOptions};
//!
//! # async fn run() -> weft::Result<()> {
//! let client = Client::new();
//! let mut response = client
//!     .request(http::Method::GET, "https://example.com/robots.txt", RequestOptions::new())
//!     .await?;
//! let body = response.bytes().await?;
//! println!("{} ({} bytes)", response.status(), body.len());
//! # Ok(())
//! # }
//! ```
//!
//! Connections are pooled per origin (scheme, host, port, TLS profile,
//! proxy route). HTTP/1.1 connections serve one request at a time and
//! park LIFO; multiplexed connections are shared by concurrent requests
//! up to their negotiated stream limit and are PING-probed while idle.

mod client;
mod config;
mod conn;
mod dns;
mod error;
mod ext;
mod http;
mod keepalive;
mod pool;
mod proxy;
mod redirect;
mod retry;
mod tls;

pub use crate::client::Client;
pub use crate::config::{ClientConfig, KeepaliveConfig, PoolConfig, ProtocolConfig, TimeoutConfig};
pub use crate::dns::{GaiResolver, Name, Resolve, Resolving};
pub use crate::error::{Error, Kind, PoolReason, Result, RetryReason, SslReason, TimeoutPhase};
pub use crate::ext::Extension;
pub use crate::http::body::{Body, BodySender};
pub use crate::http::request::{Request, RequestOptions};
pub use crate::http::response::{ConnectionInfo, Response};
pub use crate::http::url::Scheme;
pub use crate::proxy::{NoProxy, Proxy};
pub use crate::retry::Retry;
pub use crate::tls::{ClientCert, TlsConfig};

pub mod redirect_policy {
    //! Redirect policy surface.
    pub use crate::redirect::{Action, Attempt, Policy};
}

use std::sync::{OnceLock, RwLock};

/// Process-wide client backing the module-level [`request`] helper.
static GLOBAL_CLIENT: OnceLock<RwLock<Option<Client>>> = OnceLock::new();

fn global_cell() -> &'static RwLock<Option<Client>> {
    GLOBAL_CLIENT.get_or_init(|| RwLock::new(None))
}

fn global_client() -> Client {
    let cell = global_cell();
    if let Some(client) = cell.read().expect("global client lock").as_ref() {
        return client.clone();
    }
    let mut guard = cell.write().expect("global client lock");
    guard.get_or_insert_with(Client::new).clone()
}

/// Dispatch a request through the lazily-initialized process-wide client.
pub async fn request(
    method: ::http::Method,
    target: &str,
    opts: RequestOptions,
) -> Result<Response> {
    global_client().request(method, target, opts).await
}

/// Drop the process-wide client, closing its pools. The next call to
/// [`request`] builds a fresh one. Intended for tests.
pub fn reset() {
    let mut guard = global_cell().write().expect("global client lock");
    if let Some(client) = guard.take() {
        client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_client_is_reused_until_reset() {
        let a = global_client();
        let b = global_client();
        assert!(std::sync::Arc::ptr_eq(&a.inner_ptr(), &b.inner_ptr()));
        reset();
        let c = global_client();
        assert!(!std::sync::Arc::ptr_eq(&a.inner_ptr(), &c.inner_ptr()));
        reset();
    }
}
