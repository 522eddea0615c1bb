//! Post-upgrade protocol handle.
//!
//! After `101 Switching Protocols` (HTTP/1.1) or an accepted RFC 8441
//! extended CONNECT (HTTP/2), the dispatcher hands the stream to an
//! [`Extension`] instead of releasing the connection. Framing above the
//! byte/DATA level (WebSocket opcodes, masking) is the caller's concern.
//!
//! Closing the extension closes the transport on HTTP/1.1; on HTTP/2 it
//! ends only the stream and the connection returns to its pool.

use std::future::poll_fn;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::conn::{BoxedIo, Upgraded};
use crate::error::{self, Result};
use crate::http::response::ReleaseFn;
use crate::pool::Outcome;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// A borrowed, upgraded stream.
pub struct Extension {
    inner: Inner,
    ping: Option<std::sync::Arc<crate::conn::Conn>>,
    release: Option<ReleaseFn>,
}

enum Inner {
    H1 {
        io: BoxedIo,
        leftover: BytesMut,
    },
    H2 {
        send: h2::SendStream<Bytes>,
        recv: h2::RecvStream,
    },
    /// Terminal state after `close`.
    Closed,
}

impl Extension {
    pub(crate) fn new(
        upgraded: Upgraded,
        ping: Option<std::sync::Arc<crate::conn::Conn>>,
        release: ReleaseFn,
    ) -> Extension {
        let inner = match upgraded {
            Upgraded::H1 { io, leftover } => Inner::H1 { io, leftover },
            Upgraded::H2 { send, recv } => Inner::H2 { send, recv },
        };
        Extension {
            inner,
            ping,
            release: Some(release),
        }
    }

    /// Next payload from the peer; `None` when the peer closed.
    pub async fn next_payload(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            Inner::H1 { io, leftover } => {
                if !leftover.is_empty() {
                    return Ok(Some(leftover.split().freeze()));
                }
                let mut buf = BytesMut::with_capacity(8 * 1024);
                let n = io.read_buf(&mut buf).await.map_err(error::read)?;
                if n == 0 {
                    Ok(None)
                } else {
                    Ok(Some(buf.freeze()))
                }
            }
            Inner::H2 { recv, .. } => match recv.data().await {
                Some(Ok(chunk)) => {
                    let _ = recv.flow_control().release_capacity(chunk.len());
                    Ok(Some(chunk))
                }
                Some(Err(e)) => Err(error::read(e)),
                None => Ok(None),
            },
            Inner::Closed => Ok(None),
        }
    }

    /// Send one payload to the peer.
    pub async fn send_payload(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let mut payload = payload.into();
        match &mut self.inner {
            Inner::H1 { io, .. } => {
                io.write_all(&payload).await.map_err(error::write)?;
                io.flush().await.map_err(error::write)?;
                Ok(())
            }
            Inner::H2 { send, .. } => {
                while !payload.is_empty() {
                    send.reserve_capacity(payload.len());
                    let granted = poll_fn(|cx| send.poll_capacity(cx))
                        .await
                        .ok_or_else(|| error::write("stream closed"))?
                        .map_err(error::write)?;
                    let frame = payload.split_to(granted.min(payload.len()));
                    send.send_data(frame, false).map_err(error::write)?;
                }
                Ok(())
            }
            Inner::Closed => Err(error::write("extension closed")),
        }
    }

    /// Verify the underlying connection is alive.
    pub async fn ping(&mut self) -> Result<()> {
        match (&self.inner, &self.ping) {
            (Inner::Closed, _) => Err(error::write("extension closed")),
            // Raw HTTP/1.1 transports have no control frames below the
            // application framing.
            (Inner::H1 { .. }, _) => Ok(()),
            (_, Some(conn)) => conn.ping(PING_TIMEOUT).await,
            (_, None) => Ok(()),
        }
    }

    /// Shut the stream down and give the connection back.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::H1 { mut io, .. } => {
                let _ = io.shutdown().await;
            }
            Inner::H2 {
                mut send,
                mut recv,
            } => {
                let _ = send.send_data(Bytes::new(), true);
                // Let the peer finish; residual frames are discarded.
                while let Some(chunk) = recv.data().await {
                    match chunk {
                        Ok(data) => {
                            let _ = recv.flow_control().release_capacity(data.len());
                        }
                        Err(_) => break,
                    }
                }
            }
            Inner::Closed => {}
        }
        if let Some(release) = self.release.take() {
            release(Outcome::Clean);
        }
        Ok(())
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(Outcome::Canceled);
        }
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.inner {
            Inner::H1 { .. } => "h1",
            Inner::H2 { .. } => "h2",
            Inner::Closed => "closed",
        };
        f.debug_struct("Extension").field("protocol", &proto).finish()
    }
}
