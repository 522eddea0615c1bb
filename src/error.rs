//! Crate-wide error type.
//!
//! A single [`Error`] with a [`Kind`] taxonomy and a `source` chain back to
//! the first underlying cause. Connection faults always carry enough
//! classification for the retry controller to decide between retrying and
//! surfacing.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;
use url::Url;

/// A `Result` alias where the `Err` case is `weft::Error`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when dispatching a request.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Kind {
    /// Malformed request input (URL, headers, body serialization).
    Builder,
    /// DNS failure, TCP/UDP connect failure.
    Connect,
    /// TLS handshake failure.
    Ssl(SslReason),
    /// Transport EOF mid-response, read timeout, stream reset received.
    Read,
    /// Transport closed during request send.
    Write,
    /// Malformed framing, illegal header, codec failure.
    Protocol,
    /// Pool-state failures.
    Pool(PoolReason),
    /// Retry counters exhausted.
    Retry(RetryReason),
    /// A deadline elapsed.
    Timeout(TimeoutPhase),
    /// Content-encoding failure on the response body.
    Decode,
    /// Redirect handling failure (bad Location, non-rewindable body).
    Redirect,
    /// A status surfaced because the policy asked for it.
    Status(StatusCode),
}

/// Why a TLS handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslReason {
    /// Certificate failed verification.
    Certificate,
    /// Certificate is not valid for the requested host.
    HostnameMismatch,
    /// Any other handshake failure.
    Handshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolReason {
    /// The per-origin pool is at capacity and `block_if_full` is off.
    Full,
    /// The manager was closed.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// A retry counter reached zero.
    MaxRetry,
    /// The redirect counter reached zero.
    TooManyRedirects,
}

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Write,
    /// The wall-clock deadline covering all attempts.
    Total,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source: None,
                url: None,
            }),
        }
    }

    pub(crate) fn with<E: Into<BoxError>>(mut self, source: E) -> Error {
        self.inner.source = Some(source.into());
        self
    }

    pub(crate) fn with_url(mut self, url: Url) -> Error {
        self.inner.url = Some(url);
        self
    }

    /// The error's classification.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// The URL associated with this error, if any.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// The status code, when the error surfaced an HTTP status.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect | Kind::Ssl(_))
            || matches!(self.inner.kind, Kind::Timeout(TimeoutPhase::Connect))
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self.inner.kind, Kind::Ssl(_))
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Read | Kind::Timeout(TimeoutPhase::Read)
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Write | Kind::Timeout(TimeoutPhase::Write)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    pub fn is_pool_full(&self) -> bool {
        matches!(self.inner.kind, Kind::Pool(PoolReason::Full))
    }

    pub fn is_max_retry(&self) -> bool {
        matches!(self.inner.kind, Kind::Retry(_))
    }

    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::Retry(RetryReason::TooManyRedirects))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }
}

// Constructor helpers used throughout the crate.

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder).with(e)
}

pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Connect).with(e)
}

pub(crate) fn ssl<E: Into<BoxError>>(reason: SslReason, e: E) -> Error {
    Error::new(Kind::Ssl(reason)).with(e)
}

pub(crate) fn read<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Read).with(e)
}

pub(crate) fn write<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Write).with(e)
}

pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Protocol).with(e)
}

pub(crate) fn pool(reason: PoolReason) -> Error {
    Error::new(Kind::Pool(reason))
}

pub(crate) fn timeout(phase: TimeoutPhase) -> Error {
    Error::new(Kind::Timeout(phase))
}

pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Decode).with(e)
}

pub(crate) fn redirect<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Redirect).with(e)
}

pub(crate) fn status_surfaced(code: StatusCode) -> Error {
    Error::new(Kind::Status(code))
}

pub(crate) fn max_retry(last: Error) -> Error {
    let reason = if last.is_too_many_redirects() {
        RetryReason::TooManyRedirects
    } else {
        RetryReason::MaxRetry
    };
    Error::new(Kind::Retry(reason)).with(last)
}

pub(crate) fn too_many_redirects(url: Url) -> Error {
    Error::new(Kind::Retry(RetryReason::TooManyRedirects)).with_url(url)
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("weft::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref url) = self.inner.url {
            f.field("url", &url.as_str());
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Connect => f.write_str("connection error")?,
            Kind::Ssl(SslReason::Certificate) => f.write_str("certificate verify failed")?,
            Kind::Ssl(SslReason::HostnameMismatch) => {
                f.write_str("certificate hostname mismatch")?
            }
            Kind::Ssl(SslReason::Handshake) => f.write_str("TLS handshake failed")?,
            Kind::Read => f.write_str("error reading response")?,
            Kind::Write => f.write_str("error sending request")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Pool(PoolReason::Full) => f.write_str("connection pool is full")?,
            Kind::Pool(PoolReason::Shutdown) => f.write_str("connection pool is shut down")?,
            Kind::Retry(RetryReason::MaxRetry) => f.write_str("max retries exceeded")?,
            Kind::Retry(RetryReason::TooManyRedirects) => f.write_str("too many redirects")?,
            Kind::Timeout(TimeoutPhase::Connect) => f.write_str("connect timed out")?,
            Kind::Timeout(TimeoutPhase::Read) => f.write_str("read timed out")?,
            Kind::Timeout(TimeoutPhase::Write) => f.write_str("write timed out")?,
            Kind::Timeout(TimeoutPhase::Total) => f.write_str("request deadline elapsed")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::Status(code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        }
        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({url})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|err| &**err as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_chain_reaches_first_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = max_retry(connect(io));
        assert!(err.is_max_retry());

        let mut cause: &dyn StdError = &err;
        let mut depth = 0;
        while let Some(next) = cause.source() {
            cause = next;
            depth += 1;
        }
        assert_eq!(depth, 2);
        assert!(cause.to_string().contains("refused"));
    }

    #[test]
    fn classification_predicates() {
        assert!(ssl(SslReason::HostnameMismatch, "bad cert").is_connect());
        assert!(timeout(TimeoutPhase::Read).is_read());
        assert!(timeout(TimeoutPhase::Read).is_timeout());
        assert!(!pool(PoolReason::Full).is_connect());
        assert!(pool(PoolReason::Full).is_pool_full());
    }
}
