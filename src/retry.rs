//! Retry policy and counters.
//!
//! Counters decrement toward zero; a counter at zero surfaces the next
//! failure of its class wrapped in a max-retry error. `None` counters
//! defer to `total`. Backoff grows exponentially and a `Retry-After`
//! header wins when it asks for a longer wait.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use http::header::{HeaderMap, HeaderName, RETRY_AFTER};
use http::{Method, StatusCode};

/// Retry policy for one `request` call.
#[derive(Debug, Clone)]
pub struct Retry {
    /// Overall attempt budget; every decrement also decrements this.
    pub total: Option<u32>,
    pub connect: Option<u32>,
    pub read: Option<u32>,
    pub redirect: Option<u32>,
    pub status: Option<u32>,
    pub other: Option<u32>,
    /// Response statuses that trigger a retry (subject to method rules).
    pub status_forcelist: HashSet<u16>,
    /// Methods eligible for read/status retries; `None` allows all.
    pub allowed_methods: Option<HashSet<Method>>,
    pub backoff_factor: f64,
    pub backoff_max: f64,
    /// Uniform random extra sleep in `[0, backoff_jitter]` seconds.
    pub backoff_jitter: f64,
    pub respect_retry_after: bool,
    /// Surface an error (instead of the response) when status retries
    /// exhaust.
    pub raise_on_status: bool,
    /// Surface an error when redirects exhaust; otherwise return the 3xx.
    pub raise_on_redirect: bool,
    /// Headers scrubbed on cross-origin redirect hops, in addition to the
    /// built-in sensitive set.
    pub remove_headers_on_redirect: Vec<HeaderName>,
    /// Completed attempts, drives the backoff exponent.
    history: u32,
}

fn default_allowed_methods() -> HashSet<Method> {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
        Method::TRACE,
    ]
    .into_iter()
    .collect()
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(3)
    }
}

impl Retry {
    pub fn new(total: u32) -> Retry {
        Retry {
            total: Some(total),
            connect: None,
            read: None,
            redirect: None,
            status: None,
            other: None,
            status_forcelist: HashSet::new(),
            allowed_methods: Some(default_allowed_methods()),
            backoff_factor: 0.0,
            backoff_max: 120.0,
            backoff_jitter: 0.0,
            respect_retry_after: true,
            raise_on_status: true,
            raise_on_redirect: true,
            remove_headers_on_redirect: Vec::new(),
            history: 0,
        }
    }

    /// No retries at all: surface the first failure.
    pub fn none() -> Retry {
        Retry {
            total: Some(0),
            redirect: Some(0),
            ..Retry::new(0)
        }
    }

    pub fn with_status_forcelist(mut self, statuses: impl IntoIterator<Item = u16>) -> Retry {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    pub fn with_backoff(mut self, factor: f64, max: f64) -> Retry {
        self.backoff_factor = factor;
        self.backoff_max = max;
        self
    }

    pub fn with_redirects(mut self, redirect: u32) -> Retry {
        self.redirect = Some(redirect);
        self
    }

    pub(crate) fn attempts_made(&self) -> u32 {
        self.history
    }

    fn decrement(counter: &mut Option<u32>) -> bool {
        match counter {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }

    fn step(&self, class: fn(&mut Retry) -> &mut Option<u32>) -> Option<Retry> {
        let mut next = self.clone();
        next.history += 1;
        let class_ok = Self::decrement(class(&mut next));
        let total_ok = Self::decrement(&mut next.total);
        (class_ok && total_ok).then_some(next)
    }

    /// Connect failure, before any request byte was sent.
    pub(crate) fn increment_connect(&self) -> Option<Retry> {
        self.step(|r| &mut r.connect)
    }

    /// Transport failure before any request byte was sent.
    pub(crate) fn increment_presend(&self) -> Option<Retry> {
        let mut next = self.clone();
        next.history += 1;
        Self::decrement(&mut next.total).then_some(next)
    }

    /// Read failure after the request was (partially) sent.
    pub(crate) fn increment_read(&self) -> Option<Retry> {
        self.step(|r| &mut r.read)
    }

    pub(crate) fn increment_status(&self) -> Option<Retry> {
        self.step(|r| &mut r.status)
    }

    pub(crate) fn increment_redirect(&self) -> Option<Retry> {
        self.step(|r| &mut r.redirect)
    }

    pub(crate) fn increment_other(&self) -> Option<Retry> {
        self.step(|r| &mut r.other)
    }

    pub(crate) fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.status_forcelist.contains(&status.as_u16())
    }

    pub(crate) fn is_method_allowed(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            Some(allowed) => allowed.contains(method),
            None => true,
        }
    }

    /// `min(backoff_max, backoff_factor * 2^(attempt-1))` plus jitter.
    pub(crate) fn backoff_time(&self) -> Duration {
        if self.history == 0 || self.backoff_factor <= 0.0 {
            return jitter_only(self.backoff_jitter);
        }
        let exp = (self.history - 1).min(31);
        let backoff = self.backoff_factor * (1u64 << exp) as f64;
        let capped = backoff.min(self.backoff_max).max(0.0);
        Duration::from_secs_f64(capped) + jitter_only(self.backoff_jitter)
    }

    /// The wait before the next attempt: the larger of backoff and any
    /// `Retry-After` the server sent.
    pub(crate) fn sleep_duration(&self, headers: Option<&HeaderMap>) -> Duration {
        let backoff = self.backoff_time();
        if !self.respect_retry_after {
            return backoff;
        }
        let retry_after = headers
            .and_then(|h| h.get(RETRY_AFTER))
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        match retry_after {
            Some(ra) if ra > backoff => ra,
            _ => backoff,
        }
    }
}

fn jitter_only(jitter: f64) -> Duration {
    if jitter <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(fastrand::f64() * jitter)
    }
}

/// `Retry-After` accepts delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}
