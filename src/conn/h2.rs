//! HTTP/2 connection over the `h2` crate.
//!
//! One handshake per transport; streams are opened through a cloned
//! `SendRequest`. The connection driver runs as its own task and flips the
//! shared state to draining/closed on GOAWAY or transport loss. The
//! PingPong handle feeds the keepalive scheduler.

use std::future::poll_fn;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Version};
use tokio::sync::{mpsc, oneshot};

use super::{BoxedIo, Shared};
use crate::error::{self, Error, Result, TimeoutPhase};
use crate::http::body::Body;
use crate::http::response::{BodyChannel, ResponseHead};

pub(crate) struct H2Conn {
    /// Cloned per stream; the mutex only guards the clone.
    send: std::sync::Mutex<h2::client::SendRequest<Bytes>>,
    ping: tokio::sync::Mutex<Option<h2::PingPong>>,
    driver: tokio::task::JoinHandle<()>,
}

pub(crate) enum H2Reply {
    Stream(BodyChannel),
    /// RFC 8441 extended CONNECT accepted; both stream halves belong to
    /// the extension now.
    Upgraded(h2::SendStream<Bytes>, h2::RecvStream),
}

impl H2Conn {
    pub(crate) async fn handshake(
        io: BoxedIo,
        shared: Shared,
        default_max_streams: usize,
    ) -> Result<H2Conn> {
        let (send, mut connection) = h2::client::handshake(io).await.map_err(h2_connect_error)?;
        let ping = connection.ping_pong();

        let negotiated = connection.max_concurrent_send_streams();
        let max = if negotiated == 0 || negotiated == usize::MAX {
            default_max_streams
        } else {
            negotiated.min(default_max_streams)
        };
        shared.set_max_streams(max);

        let driver_shared = shared.clone_handle();
        let driver = tokio::spawn(async move {
            match connection.await {
                Ok(()) => driver_shared.close("connection finished"),
                Err(e) if e.is_go_away() => driver_shared.close("goaway"),
                Err(_) => driver_shared.close("transport error"),
            }
        });

        Ok(H2Conn {
            send: std::sync::Mutex::new(send),
            ping: tokio::sync::Mutex::new(ping),
            driver,
        })
    }

    /// True once the peer has advertised RFC 8441 extended CONNECT.
    pub(crate) fn extended_connect_enabled(&self) -> bool {
        self.send
            .lock()
            .expect("send handle lock")
            .is_extended_connect_protocol_enabled()
    }

    pub(crate) async fn send(
        &self,
        request: Request<()>,
        mut body: Body,
        shared: &Shared,
        read_timeout: Duration,
        extended_connect: bool,
    ) -> Result<(ResponseHead, H2Reply)> {
        let end_of_stream = !extended_connect && body.is_empty_body();

        let mut send = self.send.lock().expect("send handle lock").clone();
        poll_fn(|cx| send.poll_ready(cx))
            .await
            .map_err(|e| stream_error(e, shared))?;
        let (response_fut, send_stream) = send
            .send_request(request, end_of_stream)
            .map_err(|e| stream_error(e, shared))?;
        shared.touch();

        let mut send_stream = Some(send_stream);
        if !end_of_stream && !extended_connect {
            let mut stream = send_stream.take().expect("stream taken once");
            let write_shared = shared.clone_handle();
            tokio::spawn(async move {
                if let Err(e) = write_h2_body(&mut stream, &mut body, &write_shared).await {
                    tracing::debug!(target: "weft::conn", error = %e, "h2 request body failed");
                    stream.send_reset(h2::Reason::CANCEL);
                }
            });
        }

        let response = match tokio::time::timeout(read_timeout, response_fut).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(stream_error(e, shared)),
            Err(_) => return Err(error::timeout(TimeoutPhase::Read)),
        };
        shared.touch();

        let (parts, recv_stream) = response.into_parts();
        let head = ResponseHead {
            status: parts.status,
            version: Version::HTTP_2,
            headers: parts.headers,
        };

        if extended_connect {
            if !head.status.is_success() {
                return Ok((
                    head,
                    H2Reply::Stream(empty_body_channel()),
                ));
            }
            let send_stream = send_stream.expect("extended CONNECT keeps its send stream");
            return Ok((head, H2Reply::Upgraded(send_stream, recv_stream)));
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(8);
        let (trailers_tx, trailers_rx) = oneshot::channel();
        let pump_shared = shared.clone_handle();
        tokio::spawn(pump_h2_body(
            recv_stream,
            tx,
            trailers_tx,
            pump_shared,
            read_timeout,
        ));

        Ok((
            head,
            H2Reply::Stream(BodyChannel::Stream {
                rx,
                trailers: trailers_rx,
            }),
        ))
    }

    /// Send a PING and wait for the ACK.
    pub(crate) async fn ping(&self, timeout: Duration) -> Result<()> {
        let mut guard = self.ping.lock().await;
        let ping = guard
            .as_mut()
            .ok_or_else(|| error::protocol("ping handle unavailable"))?;
        match tokio::time::timeout(timeout, ping.ping(h2::Ping::opaque())).await {
            Ok(Ok(_pong)) => Ok(()),
            Ok(Err(e)) => Err(error::read(e)),
            Err(_) => Err(error::timeout(TimeoutPhase::Read)),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.driver.abort();
    }
}

fn empty_body_channel() -> BodyChannel {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(1);
    let (trailers_tx, trailers_rx) = oneshot::channel();
    drop(tx);
    drop(trailers_tx);
    BodyChannel::Stream {
        rx,
        trailers: trailers_rx,
    }
}

fn h2_connect_error(e: h2::Error) -> Error {
    error::connect(e)
}

/// Classify a stream-level failure; a GOAWAY drains the whole connection.
fn stream_error(e: h2::Error, shared: &Shared) -> Error {
    if e.is_go_away() {
        shared.drain();
        // Streams refused by GOAWAY were never processed; retry-safe.
        return error::read(e);
    }
    if e.is_reset() {
        return error::read(e);
    }
    if e.is_io() {
        return error::read(e);
    }
    error::protocol(e)
}

async fn write_h2_body(
    stream: &mut h2::SendStream<Bytes>,
    body: &mut Body,
    shared: &Shared,
) -> Result<()> {
    while let Some(chunk) = body.next_chunk().await {
        let mut chunk = chunk.map_err(error::write)?;
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = poll_fn(|cx| stream.poll_capacity(cx))
                .await
                .ok_or_else(|| error::write("stream closed while sending body"))?
                .map_err(error::write)?;
            let frame = chunk.split_to(granted.min(chunk.len()));
            stream.send_data(frame, false).map_err(error::write)?;
            shared.touch();
        }
    }
    stream.send_data(Bytes::new(), true).map_err(error::write)?;
    Ok(())
}

async fn pump_h2_body(
    mut recv: h2::RecvStream,
    tx: mpsc::Sender<Result<Bytes, Error>>,
    trailers_tx: oneshot::Sender<HeaderMap>,
    shared: Shared,
    read_timeout: Duration,
) {
    loop {
        let next = match tokio::time::timeout(read_timeout, recv.data()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx.send(Err(error::timeout(TimeoutPhase::Read))).await;
                return;
            }
        };
        match next {
            Some(Ok(chunk)) => {
                shared.touch();
                let len = chunk.len();
                if tx.send(Ok(chunk)).await.is_err() {
                    // Consumer cancelled; dropping the stream resets it.
                    return;
                }
                let _ = recv.flow_control().release_capacity(len);
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(error::read(e))).await;
                return;
            }
            None => break,
        }
    }
    match tokio::time::timeout(read_timeout, recv.trailers()).await {
        Ok(Ok(Some(trailers))) => {
            let _ = trailers_tx.send(trailers);
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => {
            let _ = tx.send(Err(error::read(e))).await;
        }
        Err(_) => {
            let _ = tx.send(Err(error::timeout(TimeoutPhase::Read))).await;
        }
    }
}

/// Build the `http::Request` for a plain or extended-CONNECT h2 stream.
pub(crate) fn build_request(
    method: &Method,
    url: &url::Url,
    headers: &http::HeaderMap,
    websocket: bool,
) -> Result<Request<()>> {
    // The :scheme pseudo-header is always http(s), including for RFC 8441
    // WebSocket streams.
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        _ => "https",
    };
    let mut uri = format!("{scheme}://{}", url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        uri.push_str(&format!(":{port}"));
    }
    uri.push_str(url.path());
    if let Some(q) = url.query() {
        uri.push('?');
        uri.push_str(q);
    }

    let mut builder = Request::builder().uri(uri).version(Version::HTTP_2);
    if websocket {
        builder = builder.method(Method::CONNECT);
        builder = builder.extension(h2::ext::Protocol::from_static("websocket"));
    } else {
        builder = builder.method(method.clone());
    }
    let mut request = builder.body(()).map_err(error::builder)?;
    for (name, value) in headers {
        // Connection-specific headers do not survive onto h2 streams.
        if is_connection_level(name) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    Ok(request)
}

fn is_connection_level(name: &http::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}
