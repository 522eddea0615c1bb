//! Incoming response surface.
//!
//! The response owns the body channel fed by the connection's stream pump
//! and a release hook back into the owning pool. The hook fires exactly
//! once: on full body consumption, on `release_conn`, or on drop.

use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::{self, Error, Result};
use crate::ext::Extension;
use crate::pool::Outcome;

/// Status line and headers, available as soon as the first HEADERS frame
/// or status line arrives.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Details about the connection a response arrived on.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Negotiated protocol as 11, 20 or 30.
    pub http_version: u32,
    /// Peer address the transport connected to.
    pub peer_addr: Option<SocketAddr>,
    /// Negotiated TLS protocol version, if encrypted.
    pub tls_version: Option<String>,
    /// Negotiated cipher suite, if encrypted.
    pub cipher: Option<String>,
    pub resolution_latency: Option<Duration>,
    pub established_latency: Option<Duration>,
    pub tls_handshake_latency: Option<Duration>,
}

pub(crate) type ReleaseFn = Box<dyn FnOnce(Outcome) + Send>;

pub(crate) enum BodyChannel {
    Stream {
        rx: mpsc::Receiver<Result<Bytes, Error>>,
        trailers: oneshot::Receiver<HeaderMap>,
    },
    /// Upgraded responses (101 / extended CONNECT) carry no HTTP body.
    None,
}

enum Decoder {
    Identity,
    Gzip,
    Deflate,
}

/// An HTTP response with a streaming body.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: BodyChannel,
    decoder: Decoder,
    /// Set once the (possibly decoded) body has been fully buffered.
    buffered: Option<BytesMut>,
    trailers: Option<HeaderMap>,
    info: ConnectionInfo,
    extension: Option<Extension>,
    release: Option<ReleaseFn>,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        url: Url,
        body: BodyChannel,
        info: ConnectionInfo,
        decode_content: bool,
        release: ReleaseFn,
    ) -> Response {
        let decoder = if decode_content {
            match head
                .headers
                .get(http::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
            {
                Some("gzip") => Decoder::Gzip,
                Some("deflate") => Decoder::Deflate,
                _ => Decoder::Identity,
            }
        } else {
            Decoder::Identity
        };
        Response {
            status: head.status,
            version: head.version,
            headers: head.headers,
            url,
            body,
            decoder,
            buffered: None,
            trailers: None,
            info,
            extension: None,
            release: Some(release),
        }
    }

    pub(crate) fn set_extension(&mut self, extension: Extension) {
        self.extension = Some(extension);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Protocol version as 11, 20 or 30.
    pub fn version(&self) -> u32 {
        match self.version {
            Version::HTTP_2 => 20,
            Version::HTTP_3 => 30,
            _ => 11,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// The post-upgrade protocol handle, when the request negotiated one.
    pub fn extension(&mut self) -> Option<&mut Extension> {
        self.extension.as_mut()
    }

    /// Consume the response, keeping only the upgraded protocol handle.
    pub fn into_extension(mut self) -> Option<Extension> {
        self.extension.take()
    }

    /// Trailer headers, present only after the body has been fully read.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Next body chunk, `None` at end of body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(buf) = &mut self.buffered {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(buf.split().freeze()));
        }
        match self.decoder {
            Decoder::Identity => self.next_raw_chunk().await,
            // Content-coded bodies are decoded whole; the first chunk call
            // drains the stream.
            Decoder::Gzip | Decoder::Deflate => {
                self.buffer_decoded().await?;
                self.chunk_from_buffer()
            }
        }
    }

    /// Read and return the remaining body.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Deserialize the remaining body as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let data = self.bytes().await?;
        serde_json::from_slice(&data).map_err(error::decode)
    }

    /// Buffer the whole body now so the connection is settled before the
    /// response is handed out.
    pub(crate) async fn preload(&mut self) -> Result<()> {
        if self.buffered.is_some() {
            return Ok(());
        }
        match self.decoder {
            Decoder::Identity => {
                let mut out = BytesMut::new();
                while let Some(chunk) = self.next_raw_chunk().await? {
                    out.extend_from_slice(&chunk);
                }
                self.buffered = Some(out);
            }
            Decoder::Gzip | Decoder::Deflate => self.buffer_decoded().await?,
        }
        Ok(())
    }

    /// Return the connection to its pool without reading the rest of the
    /// body. The in-flight stream is cancelled.
    pub fn release_conn(&mut self) {
        self.settle(Outcome::Canceled);
    }

    /// Drop the release hook without firing it; used when another owner
    /// (the extension) takes over the borrow.
    pub(crate) fn disarm_release(&mut self) {
        self.release = None;
    }

    fn settle(&mut self, outcome: Outcome) {
        if let Some(release) = self.release.take() {
            release(outcome);
        }
    }

    fn chunk_from_buffer(&mut self) -> Result<Option<Bytes>> {
        let buf = self.buffered.as_mut().expect("body buffered");
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf.split().freeze()))
        }
    }

    async fn next_raw_chunk(&mut self) -> Result<Option<Bytes>> {
        let (rx, trailers) = match &mut self.body {
            BodyChannel::Stream { rx, trailers } => (rx, trailers),
            BodyChannel::None => return Ok(None),
        };
        match rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                self.settle(Outcome::Broken);
                Err(e)
            }
            None => {
                if let Ok(t) = trailers.try_recv() {
                    self.trailers = Some(t);
                }
                self.settle(Outcome::Clean);
                Ok(None)
            }
        }
    }

    async fn buffer_decoded(&mut self) -> Result<()> {
        let mut raw = BytesMut::new();
        while let Some(chunk) = self.next_raw_chunk().await? {
            raw.extend_from_slice(&chunk);
        }
        let mut decoded = Vec::new();
        let result = match self.decoder {
            Decoder::Gzip => {
                flate2::read::MultiGzDecoder::new(&raw[..]).read_to_end(&mut decoded)
            }
            Decoder::Deflate => flate2::read::ZlibDecoder::new(&raw[..]).read_to_end(&mut decoded),
            Decoder::Identity => unreachable!("identity bodies are not buffered here"),
        };
        result.map_err(|e| error::decode(e).with_url(self.url.clone()))?;
        self.buffered = Some(BytesMut::from(&decoded[..]));
        Ok(())
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.settle(Outcome::Canceled);
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status: StatusCode::from_u16(status).unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    fn stream_body() -> (
        mpsc::Sender<Result<Bytes, Error>>,
        oneshot::Sender<HeaderMap>,
        BodyChannel,
    ) {
        let (tx, rx) = mpsc::channel(4);
        let (ttx, trx) = oneshot::channel();
        (tx, ttx, BodyChannel::Stream { rx, trailers: trx })
    }

    fn release_probe() -> (ReleaseFn, Arc<AtomicU8>) {
        let fired = Arc::new(AtomicU8::new(0));
        let probe = fired.clone();
        let release: ReleaseFn = Box::new(move |outcome| {
            let tag = match outcome {
                Outcome::Clean => 1,
                Outcome::Canceled => 2,
                Outcome::Broken => 3,
            };
            probe.store(tag, Ordering::SeqCst);
        });
        (release, fired)
    }

    #[tokio::test]
    async fn release_fires_clean_on_full_read() {
        let (tx, ttx, body) = stream_body();
        let (release, fired) = release_probe();
        let url = Url::parse("http://example.com/").unwrap();
        let mut resp = Response::new(head(200), url, body, Default::default(), true, release);

        tx.send(Ok(Bytes::from_static(b"hi"))).await.unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        ttx.send(trailers).unwrap();
        drop(tx);

        assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(resp.trailers().unwrap()["x-checksum"], "abc");
    }

    #[tokio::test]
    async fn release_fires_canceled_on_drop_with_unread_body() {
        let (_tx, _ttx, body) = stream_body();
        let (release, fired) = release_probe();
        let url = Url::parse("http://example.com/").unwrap();
        let resp = Response::new(head(200), url, body, Default::default(), true, release);
        drop(resp);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gzip_body_is_decoded() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();

        let (tx, _ttx, body) = stream_body();
        let (release, _) = release_probe();
        let url = Url::parse("http://example.com/").unwrap();
        let mut h = head(200);
        h.headers.insert(
            http::header::CONTENT_ENCODING,
            http::HeaderValue::from_static("gzip"),
        );
        let mut resp = Response::new(h, url, body, Default::default(), true, release);

        tx.send(Ok(Bytes::from(compressed))).await.unwrap();
        drop(tx);
        assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn corrupt_gzip_surfaces_decode_error() {
        let (tx, _ttx, body) = stream_body();
        let (release, _) = release_probe();
        let url = Url::parse("http://example.com/").unwrap();
        let mut h = head(200);
        h.headers.insert(
            http::header::CONTENT_ENCODING,
            http::HeaderValue::from_static("gzip"),
        );
        let mut resp = Response::new(h, url, body, Default::default(), true, release);

        tx.send(Ok(Bytes::from_static(b"not gzip"))).await.unwrap();
        drop(tx);
        let err = resp.bytes().await.unwrap_err();
        assert!(err.is_decode());
    }
}
