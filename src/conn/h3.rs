//! HTTP/3 connection over `quinn` + `h3`.
//!
//! QUIC-level keep-alive stands in for explicit PING frames: the h3 layer
//! exposes none, so liveness of an idle connection is delegated to the
//! transport and surfaced through `close_reason`.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use http::{HeaderMap, Method, Request, Version};
use tokio::sync::{mpsc, oneshot};

use super::Shared;
use crate::config::KeepaliveConfig;
use crate::error::{self, Error, Result, TimeoutPhase};
use crate::http::body::Body;
use crate::http::response::{BodyChannel, ResponseHead};
use crate::tls::TlsContext;

pub(crate) struct H3Conn {
    /// Cloned per stream; the mutex only guards the clone.
    send: std::sync::Mutex<h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>>,
    connection: quinn::Connection,
    endpoint: quinn::Endpoint,
    driver: tokio::task::JoinHandle<()>,
}

impl H3Conn {
    pub(crate) async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls: &TlsContext,
        keepalive: &KeepaliveConfig,
        shared: Shared,
        default_max_streams: usize,
    ) -> Result<H3Conn> {
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid bind address")
        } else {
            "[::]:0".parse().expect("valid bind address")
        };
        let endpoint = quinn::Endpoint::client(bind).map_err(error::connect)?;

        let mut client_config = tls.quic_client_config()?;
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(keepalive.effective_idle_window()));
        client_config.transport_config(Arc::new(transport));

        let connecting = endpoint
            .connect_with(client_config, addr, server_name)
            .map_err(error::connect)?;
        let connection = connecting.await.map_err(error::connect)?;

        let h3_conn = h3_quinn::Connection::new(connection.clone());
        let (mut conn_driver, send) = h3::client::new(h3_conn)
            .await
            .map_err(error::protocol)?;

        shared.set_max_streams(default_max_streams);

        let driver_shared = shared.clone_handle();
        let driver = tokio::spawn(async move {
            match poll_fn(|cx| conn_driver.poll_close(cx)).await {
                Ok(()) => driver_shared.close("connection finished"),
                Err(_) => driver_shared.close("transport error"),
            }
        });

        Ok(H3Conn {
            send: std::sync::Mutex::new(send),
            connection,
            endpoint,
            driver,
        })
    }

    pub(crate) fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub(crate) async fn send(
        &self,
        request: Request<()>,
        mut body: Body,
        shared: &Shared,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<(ResponseHead, BodyChannel)> {
        let mut send = self.send.lock().expect("send handle lock").clone();
        let mut stream = send
            .send_request(request)
            .await
            .map_err(|e| h3_error(e, shared))?;
        shared.touch();

        let send_body = async {
            while let Some(chunk) = body.next_chunk().await {
                let chunk = chunk.map_err(error::write)?;
                stream.send_data(chunk).await.map_err(error::write)?;
                shared.touch();
            }
            stream.finish().await.map_err(error::write)?;
            Ok::<(), Error>(())
        };
        match tokio::time::timeout(write_timeout, send_body).await {
            Ok(result) => result?,
            Err(_) => return Err(error::timeout(TimeoutPhase::Write)),
        }

        let response = match tokio::time::timeout(read_timeout, stream.recv_response()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(h3_error(e, shared)),
            Err(_) => return Err(error::timeout(TimeoutPhase::Read)),
        };
        shared.touch();

        let (parts, ()) = response.into_parts();
        let head = ResponseHead {
            status: parts.status,
            version: Version::HTTP_3,
            headers: parts.headers,
        };

        let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(8);
        let (trailers_tx, trailers_rx) = oneshot::channel();
        let pump_shared = shared.clone_handle();
        tokio::spawn(async move {
            pump_h3_body(stream, tx, trailers_tx, pump_shared, read_timeout).await;
        });

        Ok((
            head,
            BodyChannel::Stream {
                rx,
                trailers: trailers_rx,
            },
        ))
    }

    /// Transport-level liveness check; QUIC keep-alive does the probing.
    pub(crate) fn is_live(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub(crate) fn shutdown(&self) {
        self.driver.abort();
        self.connection.close(0u32.into(), b"client shutdown");
        self.endpoint.close(0u32.into(), b"client shutdown");
    }
}

fn h3_error(e: h3::Error, shared: &Shared) -> Error {
    // The h3 crate does not distinguish stream resets from GOAWAY on its
    // public error surface; drain conservatively so no new stream lands on
    // a connection that may be going away. Affected requests were not
    // processed and are safe to replay.
    shared.drain();
    error::read(e)
}

async fn pump_h3_body(
    mut stream: h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    tx: mpsc::Sender<Result<Bytes, Error>>,
    trailers_tx: oneshot::Sender<HeaderMap>,
    shared: Shared,
    read_timeout: Duration,
) {
    loop {
        let next = match tokio::time::timeout(read_timeout, stream.recv_data()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx.send(Err(error::timeout(TimeoutPhase::Read))).await;
                return;
            }
        };
        match next {
            Ok(Some(mut buf)) => {
                shared.touch();
                let chunk = buf.copy_to_bytes(buf.remaining());
                if tx.send(Ok(chunk)).await.is_err() {
                    // Consumer cancelled; dropping the stream resets it.
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(error::read(e))).await;
                return;
            }
        }
    }
    match tokio::time::timeout(read_timeout, stream.recv_trailers()).await {
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

/// Build the `http::Request` for an h3 stream.
pub(crate) fn build_request(
    method: &Method,
    url: &url::Url,
    headers: &HeaderMap,
) -> Result<Request<()>> {
    let mut uri = format!("https://{}", url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        uri.push_str(&format!(":{port}"));
    }
    uri.push_str(url.path());
    if let Some(q) = url.query() {
        uri.push('?');
        uri.push_str(q);
    }
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri)
        .version(Version::HTTP_3)
        .body(())
        .map_err(error::builder)?;
    for (name, value) in headers {
        if matches!(
            name.as_str(),
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host"
        ) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_targets_https_authority() {
        let url: url::Url = "https://example.com:8443/v1?k=2".parse().unwrap();
        let req = build_request(&Method::GET, &url, &HeaderMap::new()).unwrap();
        assert_eq!(req.uri().scheme_str(), Some("https"));
        assert_eq!(req.uri().authority().unwrap().as_str(), "example.com:8443");
        assert_eq!(req.uri().path_and_query().unwrap().as_str(), "/v1?k=2");
    }
}
