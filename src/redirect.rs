//! Redirect handling.
//!
//! A 3xx with `Location` is resolved against the current URL and rewritten
//! per status: 301/302/303 demote a non-GET/HEAD request to a bodyless
//! GET; 307/308 preserve method and body and therefore require a
//! rewindable body source. Hops that leave the origin scrub sensitive
//! headers. The hop budget itself lives in [`crate::retry::Retry`].

use std::error::Error as StdError;

use http::header::{
    HeaderMap, HeaderName, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    PROXY_AUTHORIZATION, WWW_AUTHENTICATE,
};
use http::{Method, StatusCode};
use url::Url;

/// A type that holds information on the next request and previous requests
/// in the redirect chain.
#[derive(Debug)]
pub struct Attempt<'a> {
    pub(crate) status: StatusCode,
    pub(crate) next: &'a Url,
    pub(crate) previous: &'a [Url],
}

/// An action to perform when a redirect status code is found.
#[derive(Debug)]
pub struct Action {
    pub(crate) inner: ActionKind,
}

#[derive(Debug)]
pub(crate) enum ActionKind {
    Follow,
    Stop,
    Error(Box<dyn StdError + Send + Sync>),
}

impl<'a> Attempt<'a> {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The next URL to redirect to.
    pub fn url(&self) -> &Url {
        self.next
    }

    /// URLs already visited in this chain.
    pub fn previous(&self) -> &[Url] {
        self.previous
    }

    pub fn follow(self) -> Action {
        Action {
            inner: ActionKind::Follow,
        }
    }

    /// Do not follow; the 3xx response is returned as the `Ok` result.
    pub fn stop(self) -> Action {
        Action {
            inner: ActionKind::Stop,
        }
    }

    pub fn error<E: Into<Box<dyn StdError + Send + Sync>>>(self, error: E) -> Action {
        Action {
            inner: ActionKind::Error(error.into()),
        }
    }
}

/// Redirect-following policy.
pub struct Policy {
    inner: PolicyKind,
}

enum PolicyKind {
    Follow,
    None,
    Custom(Box<dyn Fn(Attempt<'_>) -> Action + Send + Sync + 'static>),
}

impl Policy {
    /// Follow redirects; the hop count is bounded by the retry policy's
    /// redirect counter.
    pub fn follow() -> Policy {
        Policy {
            inner: PolicyKind::Follow,
        }
    }

    /// Never follow; 3xx responses are returned to the caller.
    pub fn none() -> Policy {
        Policy {
            inner: PolicyKind::None,
        }
    }

    pub fn custom<T>(policy: T) -> Policy
    where
        T: Fn(Attempt<'_>) -> Action + Send + Sync + 'static,
    {
        Policy {
            inner: PolicyKind::Custom(Box::new(policy)),
        }
    }

    pub(crate) fn check(&self, attempt: Attempt<'_>) -> ActionKind {
        match &self.inner {
            PolicyKind::Follow => ActionKind::Follow,
            PolicyKind::None => ActionKind::Stop,
            PolicyKind::Custom(custom) => custom(attempt).inner,
        }
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::follow()
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner {
            PolicyKind::Follow => f.write_str("Policy::Follow"),
            PolicyKind::None => f.write_str("Policy::None"),
            PolicyKind::Custom(_) => f.write_str("Policy::Custom"),
        }
    }
}

/// Whether this status redirects the method unchanged (307/308) or
/// demotes it to GET (301/302/303 with a non-GET/HEAD method).
pub(crate) fn redirect_method(status: StatusCode, method: &Method) -> Method {
    match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => method.clone(),
        _ => {
            if matches!(*method, Method::GET | Method::HEAD) {
                method.clone()
            } else {
                Method::GET
            }
        }
    }
}

pub(crate) fn preserves_body(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
    )
}

/// Drop entity headers when the body is dropped on a method demotion.
pub(crate) fn remove_content_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_TYPE);
    headers.remove(CONTENT_ENCODING);
    let content_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("content-"))
        .cloned()
        .collect();
    for name in content_headers {
        headers.remove(name);
    }
}

/// Scrub sensitive headers when the hop leaves the current host/port.
pub(crate) fn remove_sensitive_headers(
    headers: &mut HeaderMap,
    next: &Url,
    previous: &[Url],
    extra: &[HeaderName],
) {
    if let Some(previous) = previous.last() {
        let cross_origin = next.host_str() != previous.host_str()
            || next.port_or_known_default() != previous.port_or_known_default()
            || next.scheme() != previous.scheme();
        if cross_origin {
            headers.remove(AUTHORIZATION);
            headers.remove(COOKIE);
            headers.remove("cookie2");
            headers.remove(PROXY_AUTHORIZATION);
            headers.remove(WWW_AUTHENTICATE);
            for name in extra {
                headers.remove(name);
            }
        }
    }
}

/// Referer for the next hop; never downgrades https → http details.
pub(crate) fn make_referer(next: &Url, previous: &Url) -> Option<http::HeaderValue> {
    if next.scheme() == "http" && previous.scheme() == "https" {
        return None;
    }
    let mut referer = previous.clone();
    let _ = referer.set_username("");
    let _ = referer.set_password(None);
    referer.set_fragment(None);
    referer.as_str().parse().ok()
}
