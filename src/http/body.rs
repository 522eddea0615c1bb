//! Request body sources.
//!
//! A body is either a finite buffer, which can be replayed across retries
//! and 307/308 redirects, or a streaming producer, which cannot.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{self, BoxError, Result};

/// A request body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Empty,
    Bytes(Bytes),
    Channel {
        rx: mpsc::Receiver<Result<Bytes, BoxError>>,
        content_length: Option<u64>,
    },
}

/// Producer half of a streaming [`Body`].
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, BoxError>>,
}

impl Body {
    pub fn empty() -> Body {
        Body { inner: Inner::Empty }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Body {
        Body {
            inner: Inner::Bytes(data.into()),
        }
    }

    /// Serialize a value as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Body> {
        let data = serde_json::to_vec(value).map_err(error::builder)?;
        Ok(Body::bytes(data))
    }

    /// Serialize a value as `application/x-www-form-urlencoded`.
    pub fn form<T: Serialize + ?Sized>(value: &T) -> Result<Body> {
        let data = serde_urlencoded::to_string(value).map_err(error::builder)?;
        Ok(Body::bytes(data.into_bytes()))
    }

    /// A streaming body fed chunk by chunk through the returned sender.
    ///
    /// Streaming bodies are not rewindable: a request carrying one is not
    /// retried after its first byte is sent and cannot follow a 307/308.
    pub fn channel(content_length: Option<u64>) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(8);
        (
            BodySender { tx },
            Body {
                inner: Inner::Channel { rx, content_length },
            },
        )
    }

    pub(crate) fn is_rewindable(&self) -> bool {
        !matches!(self.inner, Inner::Channel { .. })
    }

    pub(crate) fn is_empty_body(&self) -> bool {
        match &self.inner {
            Inner::Empty => true,
            Inner::Bytes(b) => b.is_empty(),
            Inner::Channel { .. } => false,
        }
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Bytes(b) => Some(b.len() as u64),
            Inner::Channel { content_length, .. } => *content_length,
        }
    }

    /// A replayable copy, when this body is a finite buffer.
    pub(crate) fn try_clone(&self) -> Option<Body> {
        match &self.inner {
            Inner::Empty => Some(Body::empty()),
            Inner::Bytes(b) => Some(Body::bytes(b.clone())),
            Inner::Channel { .. } => None,
        }
    }

    /// Next chunk to put on the wire. `None` marks the end of the body.
    pub(crate) async fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        match &mut self.inner {
            Inner::Empty => None,
            Inner::Bytes(b) => {
                if b.is_empty() {
                    None
                } else {
                    Some(Ok(std::mem::take(b)))
                }
            }
            Inner::Channel { rx, .. } => rx.recv().await,
        }
    }
}

impl BodySender {
    /// Feed one chunk. Errors when the request side has gone away.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| error::write("request body receiver dropped"))
    }

    /// Abort the body with an error, surfaced to the caller as a write
    /// failure on the request.
    pub async fn abort(self, err: impl Into<BoxError>) {
        let _ = self.tx.send(Err(err.into())).await;
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::bytes(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::bytes(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::bytes(value.into_bytes())
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::bytes(Bytes::from_static(value.as_bytes()))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Empty => f.write_str("Body::Empty"),
            Inner::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Inner::Channel { content_length, .. } => f
                .debug_struct("Body::Channel")
                .field("content_length", content_length)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_body_yields_once() {
        let mut body = Body::bytes("hello");
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn channel_body_is_not_rewindable() {
        let (tx, mut body) = Body::channel(None);
        assert!(!body.is_rewindable());
        assert!(body.try_clone().is_none());

        tx.send("a").await.unwrap();
        drop(tx);
        assert_eq!(&body.next_chunk().await.unwrap().unwrap()[..], b"a");
        assert!(body.next_chunk().await.is_none());
    }

    #[test]
    fn form_round_trips() {
        let pairs = vec![("k one".to_owned(), "v&1".to_owned()), ("z".into(), "2".into())];
        let body = Body::form(&pairs).unwrap();
        let encoded = match &body.inner {
            Inner::Bytes(b) => String::from_utf8(b.to_vec()).unwrap(),
            _ => unreachable!(),
        };
        let decoded: Vec<(String, String)> = serde_urlencoded::from_str(&encoded).unwrap();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn json_preserves_scalars_and_key_order() {
        let value = serde_json::json!({"b": 1, "a": true, "s": "x", "f": 1.5});
        let body = Body::json(&value).unwrap();
        let raw = match &body.inner {
            Inner::Bytes(b) => b.clone(),
            _ => unreachable!(),
        };
        let back: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, value);
    }
}
