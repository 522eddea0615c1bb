//! A single pooled connection: one transport plus its protocol state
//! machine.
//!
//! Opening negotiates the protocol (ALPN on TCP, QUIC for HTTP/3) and
//! wraps the result in the variant that drives it. All pool-visible
//! bookkeeping (state, stream counts, activity stamps) lives in [`Shared`]
//! so driver and pump tasks can update it without holding the connection.

pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod h3;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::dns::{DynResolver, Name};
use crate::error::{self, Result, SslReason};
use crate::http::request::Request;
use crate::http::response::{BodyChannel, ConnectionInfo, ResponseHead};
use crate::http::url::{authority, request_target};
use crate::pool::key::Origin;
use crate::proxy::ProxyIntercept;
use crate::tls::TlsContext;

pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    H1,
    H2,
    H3,
}

impl Protocol {
    pub(crate) fn is_multiplexed(&self) -> bool {
        !matches!(self, Protocol::H1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    Active,
    /// No new streams; in-flight streams finish, then the connection
    /// closes.
    Draining,
    Closed,
}

struct SharedInner {
    state: Mutex<(State, &'static str)>,
    in_flight: AtomicUsize,
    max_streams: AtomicUsize,
    last_activity: Mutex<Instant>,
    last_ping: Mutex<Option<Instant>>,
}

/// Bookkeeping handle shared between the connection, its driver/pump
/// tasks, and the pool.
#[derive(Clone)]
pub(crate) struct Shared {
    inner: Arc<SharedInner>,
}

impl Shared {
    pub(crate) fn new() -> Shared {
        Shared {
            inner: Arc::new(SharedInner {
                state: Mutex::new((State::Idle, "")),
                in_flight: AtomicUsize::new(0),
                max_streams: AtomicUsize::new(1),
                last_activity: Mutex::new(Instant::now()),
                last_ping: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn clone_handle(&self) -> Shared {
        self.clone()
    }

    /// Stamp activity; every byte read or written lands here.
    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().expect("activity lock")
    }

    pub(crate) fn mark_ping(&self) {
        *self.inner.last_ping.lock().expect("ping lock") = Some(Instant::now());
    }

    pub(crate) fn set_max_streams(&self, n: usize) {
        self.inner.max_streams.store(n.max(1), Ordering::SeqCst);
    }

    pub(crate) fn max_streams(&self) -> usize {
        self.inner.max_streams.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> State {
        self.inner.state.lock().expect("state lock").0
    }

    pub(crate) fn close_reason(&self) -> &'static str {
        self.inner.state.lock().expect("state lock").1
    }

    pub(crate) fn set_state(&self, state: State) {
        let mut guard = self.inner.state.lock().expect("state lock");
        if !matches!(guard.0, State::Closed) {
            guard.0 = state;
        }
    }

    pub(crate) fn drain(&self) {
        let mut guard = self.inner.state.lock().expect("state lock");
        if matches!(guard.0, State::Idle | State::Active) {
            guard.0 = State::Draining;
        }
    }

    pub(crate) fn close(&self, reason: &'static str) {
        let mut guard = self.inner.state.lock().expect("state lock");
        if !matches!(guard.0, State::Closed) {
            *guard = (State::Closed, reason);
        }
    }

    pub(crate) fn reserve_stream(&self) -> bool {
        let guard = self.inner.state.lock().expect("state lock");
        if !matches!(guard.0, State::Idle | State::Active) {
            return false;
        }
        let max = self.max_streams();
        let prev = self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn finish_stream(&self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "stream count underflow");
    }
}

enum Proto {
    H1(tokio::sync::Mutex<h1::H1Conn>),
    H2(h2::H2Conn),
    H3(h3::H3Conn),
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The result of writing one request on a connection.
pub(crate) struct SendResult {
    pub(crate) head: ResponseHead,
    pub(crate) body: BodyChannel,
    pub(crate) upgraded: Option<Upgraded>,
}

/// Transport handed over after a successful protocol switch.
pub(crate) enum Upgraded {
    H1 {
        io: BoxedIo,
        leftover: BytesMut,
    },
    H2 {
        send: ::h2::SendStream<bytes::Bytes>,
        recv: ::h2::RecvStream,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SendOptions {
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) expect_continue: Duration,
    /// Negotiate a WebSocket stream (extended CONNECT on H2).
    pub(crate) websocket: bool,
}

pub(crate) struct Conn {
    pub(crate) id: u64,
    origin: Origin,
    proto: Proto,
    shared: Shared,
    created_at: Instant,
    retire_at: Option<Instant>,
    info: ConnectionInfo,
    keepalive_cfg: crate::config::KeepaliveConfig,
    keepalive_task: Mutex<Option<tokio::task::AbortHandle>>,
    dedicated: AtomicBool,
}

impl Conn {
    /// Open a connection for `origin`, negotiating the protocol.
    ///
    /// The caller applies the connect deadline around this future; every
    /// step here (resolve, connect, tunnel, handshake) counts against it.
    pub(crate) async fn open(
        origin: &Origin,
        proxy: Option<&ProxyIntercept>,
        cfg: &ClientConfig,
        tls: &TlsContext,
        resolver: &DynResolver,
    ) -> Result<Arc<Conn>> {
        let scheme = origin.scheme();
        let shared = Shared::new();
        let mut info = ConnectionInfo::default();

        // QUIC first when preferred; TCP is the fallback.
        if cfg.protocols.enable_http3
            && cfg.protocols.prefer_http3
            && scheme.is_tls()
            && !scheme.is_websocket()
            && proxy.is_none()
        {
            match Self::open_h3(origin, cfg, tls, resolver, shared.clone_handle(), &mut info).await
            {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(
                        target: "weft::conn",
                        origin = %origin,
                        error = %e,
                        "HTTP/3 connect failed, falling back to TCP"
                    );
                }
            }
        }

        Self::open_tcp(origin, proxy, cfg, tls, resolver, shared, info).await
    }

    async fn open_h3(
        origin: &Origin,
        cfg: &ClientConfig,
        tls: &TlsContext,
        resolver: &DynResolver,
        shared: Shared,
        info: &mut ConnectionInfo,
    ) -> Result<Arc<Conn>> {
        let addrs = resolve(resolver, origin.host(), origin.port(), info).await?;
        let started = Instant::now();
        let mut last_err = None;
        for addr in addrs {
            match h3::H3Conn::connect(
                addr,
                origin.host(),
                tls,
                &cfg.keepalive,
                shared.clone_handle(),
                cfg.protocols.default_max_streams,
            )
            .await
            {
                Ok(conn) => {
                    info.established_latency = Some(started.elapsed());
                    info.http_version = 30;
                    info.peer_addr = Some(conn.remote_address());
                    return Ok(Self::build(
                        origin.clone(),
                        Proto::H3(conn),
                        shared,
                        cfg,
                        info.clone(),
                    ));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| error::connect("no addresses to try")))
    }

    async fn open_tcp(
        origin: &Origin,
        proxy: Option<&ProxyIntercept>,
        cfg: &ClientConfig,
        tls: &TlsContext,
        resolver: &DynResolver,
        shared: Shared,
        mut info: ConnectionInfo,
    ) -> Result<Arc<Conn>> {
        let scheme = origin.scheme();
        let (connect_host, connect_port) = match proxy {
            Some(p) => (
                p.url.host_str().unwrap_or_default().to_owned(),
                p.url.port_or_known_default().unwrap_or(8080),
            ),
            None => (origin.host().to_owned(), origin.port()),
        };

        let addrs = resolve(resolver, &connect_host, connect_port, &mut info).await?;
        let started = Instant::now();
        let mut stream = connect_first(addrs).await?;
        info.established_latency = Some(started.elapsed());
        info.peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);

        // CONNECT tunnel for TLS-through-proxy.
        let tunneled = proxy.is_some() && scheme.is_tls();
        if tunneled {
            let proxy = proxy.expect("tunnel requires a proxy");
            establish_tunnel(&mut stream, origin, proxy).await?;
        }

        if scheme.is_tls() {
            let handshake_started = Instant::now();
            let server_name = rustls::pki_types::ServerName::try_from(origin.host().to_owned())
                .map_err(|e| error::ssl(SslReason::Handshake, e))?;
            let connector = match scheme {
                s if s.is_rfc8441() => tls.connector_h2(),
                s if s.is_websocket() => tls.connector_h1(),
                _ => tls.connector(),
            };
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| error::ssl(crate::tls::classify_handshake_error(&e), e))?;
            info.tls_handshake_latency = Some(handshake_started.elapsed());

            let session = tls_stream.get_ref().1;
            info.tls_version = session.protocol_version().map(|v| format!("{v:?}"));
            info.cipher = session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()));
            // Unknown or absent ALPN falls back to HTTP/1.1.
            let negotiated_h2 = session
                .alpn_protocol()
                .is_some_and(|proto| proto == &b"h2"[..]);

            if negotiated_h2 {
                if scheme.is_websocket() && !scheme.is_rfc8441() {
                    return Err(error::protocol(
                        "plain WebSocket upgrade requires HTTP/1.1, but h2 was negotiated",
                    ));
                }
                let conn = h2::H2Conn::handshake(
                    Box::new(tls_stream),
                    shared.clone_handle(),
                    cfg.protocols.default_max_streams,
                )
                .await?;
                info.http_version = 20;
                return Ok(Self::build(
                    origin.clone(),
                    Proto::H2(conn),
                    shared,
                    cfg,
                    info,
                ));
            }
            if scheme.is_rfc8441() {
                return Err(error::protocol(
                    "RFC 8441 WebSocket requires an h2 connection, but HTTP/1.1 was negotiated",
                ));
            }
            info.http_version = 11;
            let h1 = h1::H1Conn::new(Box::new(tls_stream), false, None);
            return Ok(Self::build(
                origin.clone(),
                Proto::H1(tokio::sync::Mutex::new(h1)),
                shared,
                cfg,
                info,
            ));
        }

        if scheme.is_rfc8441() {
            return Err(error::protocol(
                "RFC 8441 WebSocket requires a TLS h2 connection",
            ));
        }

        info.http_version = 11;
        let absolute_form = proxy.is_some();
        let proxy_auth = proxy.and_then(|p| p.auth.clone());
        let h1 = h1::H1Conn::new(Box::new(stream), absolute_form, proxy_auth);
        Ok(Self::build(
            origin.clone(),
            Proto::H1(tokio::sync::Mutex::new(h1)),
            shared,
            cfg,
            info,
        ))
    }

    fn build(
        origin: Origin,
        proto: Proto,
        shared: Shared,
        cfg: &ClientConfig,
        info: ConnectionInfo,
    ) -> Arc<Conn> {
        let now = Instant::now();
        let conn = Arc::new(Conn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            proto,
            shared,
            created_at: now,
            retire_at: cfg.keepalive.max_lifetime.map(|ttl| now + ttl),
            info,
            keepalive_cfg: cfg.keepalive.clone(),
            keepalive_task: Mutex::new(None),
            dedicated: AtomicBool::new(false),
        });
        tracing::debug!(
            target: "weft::conn",
            id = conn.id,
            origin = %conn.origin,
            protocol = ?conn.protocol(),
            "connection established"
        );
        conn
    }

    pub(crate) fn protocol(&self) -> Protocol {
        match self.proto {
            Proto::H1(_) => Protocol::H1,
            Proto::H2(_) => Protocol::H2,
            Proto::H3(_) => Protocol::H3,
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    pub(crate) fn state(&self) -> State {
        self.shared.state()
    }

    pub(crate) fn is_acquirable(&self, now: Instant) -> bool {
        if self.dedicated.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(retire_at) = self.retire_at {
            if now >= retire_at {
                return false;
            }
        }
        matches!(self.shared.state(), State::Idle | State::Active)
    }

    pub(crate) fn available_streams(&self) -> usize {
        self.shared
            .max_streams()
            .saturating_sub(self.shared.in_flight())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.shared.last_activity()
    }

    pub(crate) fn reserve_stream(&self) -> bool {
        self.shared.reserve_stream()
    }

    pub(crate) fn finish_stream(&self) {
        self.shared.finish_stream();
    }

    pub(crate) fn mark_dedicated(&self) {
        self.dedicated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close(&self, reason: &'static str) {
        self.shared.close(reason);
        match &self.proto {
            Proto::H1(_) => {}
            Proto::H2(conn) => conn.shutdown(),
            Proto::H3(conn) => conn.shutdown(),
        }
        tracing::debug!(
            target: "weft::conn",
            id = self.id,
            origin = %self.origin,
            reason,
            "connection closed"
        );
    }

    /// Write one request and return the response head plus body channel.
    ///
    /// The caller must have reserved a stream slot through the pool; on H1
    /// the internal lock additionally serializes requests.
    pub(crate) async fn send(
        &self,
        request: &Request,
        body: crate::http::body::Body,
        opts: SendOptions,
    ) -> Result<SendResult> {
        match &self.proto {
            Proto::H1(h1) => {
                let mut guard = h1.lock().await;
                let target = request_target(&request.url);
                let auth = authority(&request.url, request.scheme);
                let (head, reply) = guard
                    .send(
                        &request.method,
                        &target,
                        &auth,
                        &request.headers,
                        body,
                        &self.shared,
                        h1::H1SendOpts {
                            read_timeout: opts.read_timeout,
                            write_timeout: opts.write_timeout,
                            expect_continue: opts.expect_continue,
                        },
                    )
                    .await?;
                let (body, upgraded) = match reply {
                    h1::H1Body::Stream(body) => (body, None),
                    h1::H1Body::Upgraded(io, leftover) => (
                        BodyChannel::None,
                        Some(Upgraded::H1 { io, leftover }),
                    ),
                };
                Ok(SendResult {
                    head,
                    body,
                    upgraded,
                })
            }
            Proto::H2(h2conn) => {
                if opts.websocket && !h2conn.extended_connect_enabled() {
                    return Err(error::protocol(
                        "peer has not enabled RFC 8441 extended CONNECT",
                    ));
                }
                let wire = h2::build_request(
                    &request.method,
                    &request.url,
                    &request.headers,
                    opts.websocket,
                )?;
                let (head, reply) = h2conn
                    .send(wire, body, &self.shared, opts.read_timeout, opts.websocket)
                    .await?;
                let (body, upgraded) = match reply {
                    h2::H2Reply::Stream(body) => (body, None),
                    h2::H2Reply::Upgraded(send, recv) => {
                        (BodyChannel::None, Some(Upgraded::H2 { send, recv }))
                    }
                };
                Ok(SendResult {
                    head,
                    body,
                    upgraded,
                })
            }
            Proto::H3(h3conn) => {
                if opts.websocket {
                    return Err(error::protocol(
                        "WebSocket over HTTP/3 is not specified; use an h2 origin",
                    ));
                }
                let wire = h3::build_request(&request.method, &request.url, &request.headers)?;
                let (head, body) = h3conn
                    .send(
                        wire,
                        body,
                        &self.shared,
                        opts.read_timeout,
                        opts.write_timeout,
                    )
                    .await?;
                Ok(SendResult {
                    head,
                    body,
                    upgraded: None,
                })
            }
        }
    }

    /// Liveness probe for the keepalive scheduler. H1 connections are
    /// never pinged.
    pub(crate) async fn ping(&self, timeout: Duration) -> Result<()> {
        match &self.proto {
            Proto::H1(_) => Ok(()),
            Proto::H2(conn) => {
                let result = conn.ping(timeout).await;
                if result.is_ok() {
                    self.shared.mark_ping();
                    self.shared.touch();
                }
                result
            }
            Proto::H3(conn) => {
                if conn.is_live() {
                    self.shared.mark_ping();
                    Ok(())
                } else {
                    Err(error::read("QUIC connection lost"))
                }
            }
        }
    }

    pub(crate) fn set_keepalive_task(&self, handle: Option<tokio::task::AbortHandle>) {
        let mut guard = self.keepalive_task.lock().expect("keepalive lock");
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = handle;
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn keepalive_cfg(&self) -> &crate::config::KeepaliveConfig {
        &self.keepalive_cfg
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shared.close("dropped");
        if let Ok(mut guard) = self.keepalive_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

async fn resolve(
    resolver: &DynResolver,
    host: &str,
    port: u16,
    info: &mut ConnectionInfo,
) -> Result<Vec<std::net::SocketAddr>> {
    let started = Instant::now();
    let addrs = resolver
        .resolve(Name::new(host, port))
        .await
        .map_err(error::connect)?;
    info.resolution_latency = Some(started.elapsed());
    Ok(addrs)
}

async fn connect_first(addrs: Vec<std::net::SocketAddr>) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => error::connect(e),
        None => error::connect("no addresses resolved"),
    })
}

async fn establish_tunnel(
    stream: &mut TcpStream,
    origin: &Origin,
    proxy: &ProxyIntercept,
) -> Result<()> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nhost: {host}:{port}\r\n",
        host = origin.host(),
        port = origin.port(),
    );
    if let Some(auth) = &proxy.auth {
        request.push_str("proxy-authorization: ");
        request.push_str(auth.to_str().unwrap_or_default());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(error::connect)?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        if let httparse::Status::Complete(_) =
            response.parse(&buf).map_err(|e| error::connect(e))?
        {
            let code = response.code.unwrap_or(0);
            if (200..300).contains(&code) {
                return Ok(());
            }
            return Err(error::connect(format!(
                "proxy refused CONNECT tunnel with status {code}"
            )));
        }
        if buf.len() > 16 * 1024 {
            return Err(error::connect("oversized proxy CONNECT response"));
        }
        if stream.read_buf(&mut buf).await.map_err(error::connect)? == 0 {
            return Err(error::connect("proxy closed during CONNECT"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h1_never_exceeds_one_stream() {
        let shared = Shared::new();
        assert_eq!(shared.max_streams(), 1);
        assert!(shared.reserve_stream());
        assert!(!shared.reserve_stream());
        shared.finish_stream();
        assert!(shared.reserve_stream());
    }

    #[test]
    fn multiplexed_stream_cap_is_enforced() {
        let shared = Shared::new();
        shared.set_max_streams(3);
        assert!(shared.reserve_stream());
        assert!(shared.reserve_stream());
        assert!(shared.reserve_stream());
        assert!(!shared.reserve_stream());
        shared.finish_stream();
        assert!(shared.reserve_stream());
    }

    #[test]
    fn draining_accepts_no_new_streams() {
        let shared = Shared::new();
        shared.set_max_streams(10);
        assert!(shared.reserve_stream());
        shared.drain();
        assert!(!shared.reserve_stream());
        assert_eq!(shared.state(), State::Draining);
        // In-flight streams still settle.
        shared.finish_stream();
        assert_eq!(shared.in_flight(), 0);
    }

    #[test]
    fn closed_is_terminal() {
        let shared = Shared::new();
        shared.close("ping_timeout");
        shared.set_state(State::Idle);
        assert_eq!(shared.state(), State::Closed);
        assert_eq!(shared.close_reason(), "ping_timeout");
        assert!(!shared.reserve_stream());
    }
}
