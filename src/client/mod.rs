//! The request dispatcher.
//!
//! One `request` call runs the full loop: normalize the target, pick the
//! origin (with proxy routing), borrow a connection from the pool, write
//! the request, read the head, then consult the retry and redirect
//! policies on the outcome. Connections are released with an outcome the
//! pool maps to reuse-or-discard; every attempt gets fresh per-phase
//! deadlines under an optional wall-clock total.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use http::header::{HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::config::ClientConfig;
use crate::conn::{Conn, Protocol, SendOptions, SendResult};
use crate::dns::{DynResolver, GaiResolver};
use crate::error::{self, Error, Result, TimeoutPhase};
use crate::ext::Extension;
use crate::http::body::Body;
use crate::http::request::{Request, RequestOptions};
use crate::http::response::{ReleaseFn, Response};
use crate::http::url::{parse_target, Scheme};
use crate::pool::per_origin::{Checkout, PerOriginPool};
use crate::pool::{self, Origin, Outcome, PoolManager};
use crate::proxy::{Matcher, ProxyIntercept};
use crate::redirect::{self, ActionKind, Attempt};
use crate::retry::Retry;
use crate::tls::TlsContext;

/// A pooled, multi-protocol HTTP client.
///
/// Cloning is cheap and shares the pools.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    cfg: ClientConfig,
    tls: TlsContext,
    resolver: DynResolver,
    proxies: Matcher,
    pool: PoolManager,
    closed: AtomicBool,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        Client::with_config(ClientConfig::default()).expect("default configuration is valid")
    }

    pub fn with_config(cfg: ClientConfig) -> Result<Client> {
        Client::with_config_and_resolver(cfg, Arc::new(GaiResolver))
    }

    pub fn with_config_and_resolver(
        cfg: ClientConfig,
        resolver: Arc<dyn crate::dns::Resolve>,
    ) -> Result<Client> {
        cfg.validate()?;
        let tls = TlsContext::new(&cfg.tls, &cfg.protocols)?;
        let proxies = if !cfg.proxies.is_empty() {
            Matcher::explicit(cfg.proxies.clone())
        } else if cfg.proxies_from_env {
            Matcher::from_env()
        } else {
            Matcher::default()
        };
        let pool = PoolManager::new(cfg.pool.clone());
        Ok(Client {
            inner: Arc::new(ClientInner {
                cfg,
                tls,
                resolver,
                proxies,
                pool,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Dispatch a request and return the response.
    ///
    /// For `ws*` targets the method is forced to GET, the upgrade
    /// handshake headers are added, and a successful switch exposes
    /// [`Response::extension`].
    pub async fn request(
        &self,
        method: Method,
        target: &str,
        opts: RequestOptions,
    ) -> Result<Response> {
        self.dispatch(method, target, opts).await
    }

    /// Like [`Client::request`] with the body left unread.
    pub async fn open(
        &self,
        method: Method,
        target: &str,
        opts: RequestOptions,
    ) -> Result<Response> {
        self.dispatch(method, target, opts.preload_content(false)).await
    }

    /// Shut down every pool. Idle connections close immediately;
    /// borrowed ones close on release. Subsequent requests fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pool.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn inner_ptr(&self) -> Arc<ClientInner> {
        self.inner.clone()
    }

    async fn dispatch(
        &self,
        method: Method,
        target: &str,
        mut opts: RequestOptions,
    ) -> Result<Response> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(error::pool(crate::error::PoolReason::Shutdown));
        }
        let (url, scheme) = parse_target(target)?;

        if matches!(opts.timeout, Some(t) if t.is_zero()) {
            return Err(error::timeout(TimeoutPhase::Read).with_url(url));
        }

        let method = if scheme.is_websocket() {
            Method::GET
        } else {
            method
        };

        let mut headers = std::mem::take(&mut opts.headers);
        if let Some(agent) = &self.inner.cfg.user_agent {
            if !headers.contains_key(http::header::USER_AGENT) {
                if let Ok(value) = HeaderValue::from_str(agent) {
                    headers.insert(http::header::USER_AGENT, value);
                }
            }
        }
        if opts.decode_content && !headers.contains_key(http::header::ACCEPT_ENCODING) {
            headers.insert(
                http::header::ACCEPT_ENCODING,
                HeaderValue::from_static("gzip, deflate"),
            );
        }
        if scheme.is_websocket() {
            add_websocket_headers(&mut headers, scheme);
        }

        let request = Request {
            method,
            url,
            scheme,
            headers,
            body: opts.body.take().unwrap_or_default(),
            idempotent: opts.idempotent,
        };

        let retry = opts.retries.take().unwrap_or_default();
        let redirect_policy = opts.redirect.take().unwrap_or_default();
        let total_deadline = opts
            .total_timeout
            .or(self.inner.cfg.timeouts.total)
            .map(|d| Instant::now() + d);

        let body_rewindable = request.body.is_rewindable();
        Dispatch {
            client: self.inner.clone(),
            request,
            retry,
            redirect_policy,
            opts,
            total_deadline,
            visited: Vec::new(),
            body_rewindable,
        }
        .run()
        .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}

fn add_websocket_headers(headers: &mut http::HeaderMap, scheme: Scheme) {
    headers.insert(
        HeaderName::from_static("sec-websocket-version"),
        HeaderValue::from_static("13"),
    );
    if !scheme.is_rfc8441() {
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
        let mut key = [0u8; 16];
        for byte in &mut key {
            *byte = fastrand::u8(..);
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            headers.insert(HeaderName::from_static("sec-websocket-key"), value);
        }
    }
}

/// One `request` call in flight.
struct Dispatch {
    client: Arc<ClientInner>,
    request: Request,
    retry: Retry,
    redirect_policy: redirect::Policy,
    opts: RequestOptions,
    total_deadline: Option<Instant>,
    visited: Vec<Url>,
    /// Recorded before the body is extracted for an attempt: once a
    /// streaming body has been consumed, `request.body` reads as empty
    /// and can no longer answer this question.
    body_rewindable: bool,
}

enum AttemptError {
    /// Connection could not be established.
    Connect(Error),
    /// Failure on a connection that had served before any request byte of
    /// this attempt went out; always safe to retry.
    PreSend(Error),
    /// Failure after (part of) the request was written.
    AfterSend(Error),
    Fatal(Error),
}

enum AttemptOutcome {
    Done(Response),
    /// A policy consumed the response (redirect hop or forcelist status);
    /// counters are updated and the backoff already slept. Go again.
    Again,
}

impl Dispatch {
    async fn run(mut self) -> Result<Response> {
        loop {
            if let Some(deadline) = self.total_deadline {
                if Instant::now() >= deadline {
                    return Err(self.total_timeout());
                }
            }

            match self.attempt().await {
                Ok(AttemptOutcome::Done(response)) => return Ok(response),
                Ok(AttemptOutcome::Again) => continue,
                Err(AttemptError::Fatal(e)) => {
                    return Err(e.with_url(self.request.url.clone()));
                }
                Err(attempt_err) => {
                    let (err, next) = match attempt_err {
                        AttemptError::Connect(e) => {
                            let next = self.retry.increment_connect();
                            (e, next)
                        }
                        AttemptError::PreSend(e) => {
                            // The streaming body was handed to the failed
                            // attempt; a replay would send it empty.
                            if !self.body_rewindable {
                                return Err(e.with_url(self.request.url.clone()));
                            }
                            let next = self.retry.increment_presend();
                            (e, next)
                        }
                        AttemptError::AfterSend(e) => {
                            // Non-idempotent or non-replayable bodies
                            // surface after a partial send; never
                            // speculate.
                            if !self.request.is_idempotent() || !self.body_rewindable {
                                return Err(e.with_url(self.request.url.clone()));
                            }
                            let next = self.retry.increment_read();
                            (e, next)
                        }
                        AttemptError::Fatal(_) => unreachable!(),
                    };
                    match next {
                        Some(retry) => {
                            self.retry = retry;
                            tracing::debug!(
                                target: "weft::retry",
                                url = %self.request.url,
                                attempts = self.retry.attempts_made(),
                                error = %err,
                                "retrying after failure"
                            );
                            self.backoff_sleep(None).await?;
                        }
                        None => {
                            return Err(error::max_retry(err)
                                .with_url(self.request.url.clone()));
                        }
                    }
                }
            }
        }
    }

    fn total_timeout(&self) -> Error {
        error::timeout(TimeoutPhase::Total).with_url(self.request.url.clone())
    }

    /// Sleep between attempts, bounded by the total deadline.
    async fn backoff_sleep(&self, status_headers: Option<&http::HeaderMap>) -> Result<()> {
        let wait = self.retry.sleep_duration(status_headers);
        if wait.is_zero() {
            return Ok(());
        }
        if let Some(deadline) = self.total_deadline {
            if Instant::now() + wait >= deadline {
                return Err(self.total_timeout());
            }
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }

    fn origin(&self) -> (Origin, Option<ProxyIntercept>) {
        let host = self.request.url.host_str().unwrap_or_default();
        let proxy = self
            .client
            .proxies
            .intercept(host, self.request.scheme.is_tls());
        let origin = Origin::new(
            &self.request.url,
            self.request.scheme,
            self.client.tls.profile(),
            proxy.as_ref(),
        );
        (origin, proxy)
    }

    fn clamp(&self, duration: Duration) -> Duration {
        match self.total_deadline {
            Some(deadline) => duration.min(deadline.saturating_duration_since(Instant::now())),
            None => duration,
        }
    }

    async fn attempt(&mut self) -> std::result::Result<AttemptOutcome, AttemptError> {
        let timeouts = &self.client.cfg.timeouts;
        let read_timeout = self.clamp(self.opts.timeout.unwrap_or(timeouts.read));
        let write_timeout = self.clamp(self.opts.timeout.unwrap_or(timeouts.write));
        let connect_timeout = self.clamp(timeouts.connect);

        let (origin, proxy) = self.origin();
        let pool = self
            .client
            .pool
            .pool_for(&origin)
            .map_err(AttemptError::Fatal)?;

        let acquire_deadline = Instant::now() + connect_timeout;
        let checkout = pool
            .acquire(Some(acquire_deadline), self.opts.multiplexed)
            .await
            .map_err(AttemptError::Fatal)?;

        let (conn, reused) = match checkout {
            Checkout::Reuse(conn) => (conn, true),
            Checkout::Open(permit) => {
                let opened = tokio::time::timeout(
                    connect_timeout,
                    Conn::open(
                        &origin,
                        proxy.as_ref(),
                        &self.client.cfg,
                        &self.client.tls,
                        &self.client.resolver,
                    ),
                )
                .await;
                match opened {
                    Ok(Ok(conn)) => (pool.register(permit, conn), false),
                    Ok(Err(e)) => return Err(AttemptError::Connect(e)),
                    Err(_) => {
                        return Err(AttemptError::Connect(error::timeout(
                            TimeoutPhase::Connect,
                        )))
                    }
                }
            }
        };

        // Rewindable bodies are cloned per attempt; a streaming body is
        // single-shot and consumed by this attempt.
        let body = match self.request.body.try_clone() {
            Some(body) => body,
            None => std::mem::take(&mut self.request.body),
        };

        let send_opts = SendOptions {
            read_timeout,
            write_timeout,
            expect_continue: timeouts.expect_continue,
            websocket: self.request.scheme.is_rfc8441(),
        };

        let sent = conn.send(&self.request, body, send_opts).await;
        let result = match sent {
            Ok(result) => result,
            Err(e) => {
                // A stream-local fault on a multiplexed connection leaves
                // the other streams intact (a GOAWAY has already flipped
                // it to draining); an HTTP/1 transport is spent.
                let reusable = conn.is_multiplexed()
                    && !matches!(conn.state(), crate::conn::State::Closed);
                pool.release(&conn, reusable);
                // Stale idle reuse faults before this attempt's bytes can
                // have reached the peer as a processed request.
                return Err(if e.is_connect() {
                    AttemptError::Connect(e)
                } else if reused && (e.is_read() || e.is_write()) {
                    AttemptError::PreSend(e)
                } else if e.is_read() || e.is_write() {
                    AttemptError::AfterSend(e)
                } else {
                    AttemptError::Fatal(e)
                });
            }
        };

        self.conclude(pool, conn, result).await
    }

    /// Decide what the response head means: redirect, status retry,
    /// upgrade, or final response.
    async fn conclude(
        &mut self,
        pool: Arc<PerOriginPool<Conn>>,
        conn: Arc<Conn>,
        result: SendResult,
    ) -> std::result::Result<AttemptOutcome, AttemptError> {
        let SendResult {
            head,
            body,
            upgraded,
        } = result;

        let release = make_release(&pool, &conn);
        let status = head.status;
        let headers_snapshot = head.headers.clone();
        let mut response = Response::new(
            head,
            self.request.url.clone(),
            body,
            conn.info().clone(),
            self.opts.decode_content,
            release,
        );

        // Protocol switch accepted?
        if let Some(upgraded) = upgraded {
            let is_h1 = matches!(conn.protocol(), Protocol::H1);
            if is_h1 {
                // The transport now belongs to the extension.
                conn.mark_dedicated();
            }
            let ext_release = make_extension_release(&pool, &conn, is_h1);
            let ping_conn = (!is_h1).then(|| conn.clone());
            // The extension owns the borrow now; only its release hook
            // may settle the stream.
            response.disarm_release();
            response.set_extension(Extension::new(upgraded, ping_conn, ext_release));
            return Ok(AttemptOutcome::Done(response));
        }

        // Redirect?
        if status.is_redirection() {
            if let Some(location) = headers_snapshot
                .get(http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                let location = location.to_owned();
                return self.follow_redirect(response, status, &location).await;
            }
        }

        // Status forcelist? A consumed streaming body cannot be resent,
        // so the response is returned instead of retried.
        if self.retry.is_retryable_status(status) && self.body_rewindable {
            let allowed = self.retry.is_method_allowed(&self.request.method)
                || self.request.idempotent == Some(true);
            if allowed {
                match self.retry.increment_status() {
                    Some(next) => {
                        self.retry = next;
                        tracing::debug!(
                            target: "weft::retry",
                            url = %self.request.url,
                            status = status.as_u16(),
                            "status in forcelist, retrying"
                        );
                        // Drain so the connection settles before reuse.
                        let _ = response.bytes().await;
                        self.backoff_sleep(Some(&headers_snapshot))
                            .await
                            .map_err(AttemptError::Fatal)?;
                        return Ok(AttemptOutcome::Again);
                    }
                    None => {
                        if self.retry.raise_on_status {
                            return Err(AttemptError::Fatal(error::max_retry(
                                error::status_surfaced(status),
                            )));
                        }
                    }
                }
            }
        }

        if self.opts.preload_content {
            response.preload().await.map_err(AttemptError::Fatal)?;
        }
        Ok(AttemptOutcome::Done(response))
    }

    /// Rewrite the request for a 3xx hop, or return the response when the
    /// policy (or the hop budget) says stop.
    async fn follow_redirect(
        &mut self,
        mut response: Response,
        status: http::StatusCode,
        location: &str,
    ) -> std::result::Result<AttemptOutcome, AttemptError> {
        let next_url = self
            .request
            .url
            .join(location)
            .map_err(|e| AttemptError::Fatal(error::redirect(e)))?;
        let next_scheme = Scheme::parse(next_url.scheme()).ok_or_else(|| {
            AttemptError::Fatal(error::redirect(format!(
                "redirect to unsupported scheme {:?}",
                next_url.scheme()
            )))
        })?;

        self.visited.push(self.request.url.clone());
        let attempt = Attempt {
            status,
            next: &next_url,
            previous: &self.visited,
        };
        match self.redirect_policy.check(attempt) {
            ActionKind::Follow => {}
            ActionKind::Stop => {
                if self.opts.preload_content {
                    response.preload().await.map_err(AttemptError::Fatal)?;
                }
                return Ok(AttemptOutcome::Done(response));
            }
            ActionKind::Error(e) => {
                return Err(AttemptError::Fatal(error::redirect(e)));
            }
        }

        match self.retry.increment_redirect() {
            Some(next) => self.retry = next,
            None => {
                if self.retry.raise_on_redirect {
                    return Err(AttemptError::Fatal(error::too_many_redirects(
                        next_url.clone(),
                    )));
                }
                if self.opts.preload_content {
                    response.preload().await.map_err(AttemptError::Fatal)?;
                }
                return Ok(AttemptOutcome::Done(response));
            }
        }

        // Method and body rewrite per status.
        let next_method = redirect::redirect_method(status, &self.request.method);
        if redirect::preserves_body(status) {
            if !self.body_rewindable {
                return Err(AttemptError::Fatal(error::redirect(
                    "cannot replay a streaming body through a 307/308 redirect",
                )));
            }
        } else if next_method != self.request.method || !self.request.body.is_empty_body() {
            self.request.body = Body::empty();
            redirect::remove_content_headers(&mut self.request.headers);
        }
        self.request.method = next_method;

        redirect::remove_sensitive_headers(
            &mut self.request.headers,
            &next_url,
            &self.visited,
            &self.retry.remove_headers_on_redirect,
        );
        if let Some(previous) = self.visited.last() {
            if let Some(referer) = redirect::make_referer(&next_url, previous) {
                self.request
                    .headers
                    .insert(http::header::REFERER, referer);
            }
        }

        tracing::debug!(
            target: "weft::redirect",
            status = status.as_u16(),
            from = %self.request.url,
            to = %next_url,
            "following redirect"
        );

        // Settle the 3xx body so the connection can be reused, then hop.
        let _ = response.bytes().await;
        self.request.url = next_url;
        self.request.scheme = next_scheme;
        self.backoff_sleep(None).await.map_err(AttemptError::Fatal)?;
        Ok(AttemptOutcome::Again)
    }
}

fn make_release(pool: &Arc<PerOriginPool<Conn>>, conn: &Arc<Conn>) -> ReleaseFn {
    let pool = pool.clone();
    let conn = conn.clone();
    Box::new(move |outcome: Outcome| {
        let reusable = pool::reusable_after(&conn, outcome);
        pool.release(&conn, reusable);
    })
}

fn make_extension_release(
    pool: &Arc<PerOriginPool<Conn>>,
    conn: &Arc<Conn>,
    is_h1: bool,
) -> ReleaseFn {
    let pool = pool.clone();
    let conn = conn.clone();
    Box::new(move |_outcome: Outcome| {
        // An upgraded HTTP/1 transport is spent; a multiplexed stream
        // closing returns the connection to rotation.
        pool.release(&conn, !is_h1);
    })
}
