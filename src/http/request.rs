//! Outgoing request representation.

use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use url::Url;

use super::body::Body;
use super::url::Scheme;
use crate::error::{self, Result};
use crate::redirect;
use crate::retry::Retry;

/// One dispatchable request. Built by the client from a method, a target
/// and [`RequestOptions`]; lives for a single `request` call (including
/// its retries and redirect hops).
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) scheme: Scheme,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) idempotent: Option<bool>,
}

impl Request {
    /// Whether a retry after partial send is safe. Explicit caller hints
    /// win; otherwise derived from the method per RFC 9110.
    pub(crate) fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or(matches!(
            self.method,
            Method::GET
                | Method::HEAD
                | Method::OPTIONS
                | Method::PUT
                | Method::DELETE
                | Method::TRACE
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Per-call options for [`crate::Client::request`].
#[derive(Debug)]
pub struct RequestOptions {
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Body>,
    /// Per-attempt read/write deadline override.
    pub(crate) timeout: Option<Duration>,
    /// Wall-clock deadline spanning all attempts.
    pub(crate) total_timeout: Option<Duration>,
    pub(crate) retries: Option<Retry>,
    pub(crate) redirect: Option<redirect::Policy>,
    /// Read the whole body before returning the response.
    pub(crate) preload_content: bool,
    /// Transparently decode `Content-Encoding: gzip`/`deflate`.
    pub(crate) decode_content: bool,
    /// Allow sharing a multiplexed connection with other in-flight
    /// requests. When off the connection is held exclusively until the
    /// response body is consumed.
    pub(crate) multiplexed: bool,
    pub(crate) idempotent: Option<bool>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            total_timeout: None,
            retries: None,
            redirect: None,
            preload_content: true,
            decode_content: true,
            multiplexed: true,
            idempotent: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header<K, V>(mut self, name: K, value: V) -> Result<Self>
    where
        K: TryInto<HeaderName>,
        K::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        let name = name.try_into().map_err(|e| error::builder(e.into()))?;
        let value = value.try_into().map_err(|e| error::builder(e.into()))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body; sets `Content-Type: application/json`.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Some(Body::json(value)?);
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    /// Form body; sets `Content-Type: application/x-www-form-urlencoded`.
    pub fn fields<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Some(Body::form(value)?);
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: Retry) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn redirect(mut self, policy: redirect::Policy) -> Self {
        self.redirect = Some(policy);
        self
    }

    pub fn preload_content(mut self, preload: bool) -> Self {
        self.preload_content = preload;
        self
    }

    pub fn decode_content(mut self, decode: bool) -> Self {
        self.decode_content = decode;
        self
    }

    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    /// Override the method-derived idempotency used by retry decisions.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }
}
