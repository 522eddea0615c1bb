//! HTTP/1.1 connection state machine.
//!
//! One request in flight at a time. The transport is lent to a background
//! pump while a response body streams; the next `send` waits for it to be
//! handed back. A pump that cannot finish cleanly (EOF framing,
//! `Connection: close`, consumer gone) returns `Dead` and the connection
//! is discarded by the pool.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::{BoxedIo, Shared};
use crate::error::{self, Error, Result, TimeoutPhase};
use crate::http::body::Body;
use crate::http::response::{BodyChannel, ResponseHead};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

pub(crate) struct H1Conn {
    io: IoSlot,
    /// Origin-form vs absolute-form request targets (plain proxying).
    absolute_form: bool,
    proxy_auth: Option<HeaderValue>,
}

enum IoSlot {
    Ready(BoxedIo, BytesMut),
    /// Lent to a body pump; returned through the channel when it settles.
    Lent(oneshot::Receiver<IoReturn>),
    Gone,
}

enum IoReturn {
    Reusable(BoxedIo, BytesMut),
    Dead,
}

/// What `send` produced besides the head.
pub(crate) enum H1Body {
    Stream(BodyChannel),
    /// 101 Switching Protocols: the transport itself, with any bytes the
    /// peer already sent past the head.
    Upgraded(BoxedIo, BytesMut),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct H1SendOpts {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub expect_continue: Duration,
}

impl H1Conn {
    pub(crate) fn new(io: BoxedIo, absolute_form: bool, proxy_auth: Option<HeaderValue>) -> H1Conn {
        H1Conn {
            io: IoSlot::Ready(io, BytesMut::with_capacity(8 * 1024)),
            absolute_form,
            proxy_auth,
        }
    }

    async fn take_io(&mut self) -> Result<(BoxedIo, BytesMut)> {
        match std::mem::replace(&mut self.io, IoSlot::Gone) {
            IoSlot::Ready(io, buf) => Ok((io, buf)),
            IoSlot::Lent(rx) => match rx.await {
                Ok(IoReturn::Reusable(io, buf)) => Ok((io, buf)),
                Ok(IoReturn::Dead) | Err(_) => {
                    Err(error::read("connection unusable after previous response"))
                }
            },
            IoSlot::Gone => Err(error::read("connection already consumed")),
        }
    }

    pub(crate) async fn send(
        &mut self,
        method: &Method,
        target: &str,
        authority: &str,
        headers: &HeaderMap,
        mut body: Body,
        shared: &Shared,
        opts: H1SendOpts,
    ) -> Result<(ResponseHead, H1Body)> {
        let (mut io, mut buf) = self.take_io().await?;

        let body_len = body.content_length();
        let head_bytes = encode_head(
            method,
            target,
            authority,
            headers,
            body_len,
            self.absolute_form,
            self.proxy_auth.as_ref(),
        );
        write_deadline(io.write_all(&head_bytes), opts.write_timeout).await?;
        shared.touch();

        let expects_continue = headers
            .get(http::header::EXPECT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        let mut head;
        let mut body_sent = false;
        if expects_continue {
            match tokio::time::timeout(
                opts.expect_continue,
                read_head(&mut io, &mut buf, shared),
            )
            .await
            {
                Ok(parsed) => head = parsed?,
                // No interim response in time: send the body anyway.
                Err(_) => {
                    write_body(&mut io, &mut body, body_len, opts.write_timeout, shared).await?;
                    body_sent = true;
                    head = read_deadline(read_head(&mut io, &mut buf, shared), opts.read_timeout)
                        .await?;
                }
            }
        } else {
            write_body(&mut io, &mut body, body_len, opts.write_timeout, shared).await?;
            body_sent = true;
            head = read_deadline(read_head(&mut io, &mut buf, shared), opts.read_timeout).await?;
        }

        // Skip informational responses; 100 releases a pending body, 101
        // hands the transport over.
        loop {
            match head.status {
                StatusCode::CONTINUE => {
                    if !body_sent {
                        write_body(&mut io, &mut body, body_len, opts.write_timeout, shared)
                            .await?;
                        body_sent = true;
                    }
                    head = read_deadline(read_head(&mut io, &mut buf, shared), opts.read_timeout)
                        .await?;
                }
                StatusCode::SWITCHING_PROTOCOLS => {
                    return Ok((head, H1Body::Upgraded(io, buf)));
                }
                status if status.is_informational() => {
                    head = read_deadline(read_head(&mut io, &mut buf, shared), opts.read_timeout)
                        .await?;
                }
                _ => break,
            }
        }
        if expects_continue && !body_sent {
            tracing::debug!(
                target: "weft::conn",
                status = head.status.as_u16(),
                "final response arrived before 100-continue body"
            );
        }

        let framing = response_framing(method, &head)?;
        let conn_close = head
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("close"));

        let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(8);
        let (trailers_tx, trailers_rx) = oneshot::channel();
        let (ret_tx, ret_rx) = oneshot::channel();
        self.io = IoSlot::Lent(ret_rx);

        let shared = shared.clone_handle();
        tokio::spawn(pump_body(
            io,
            buf,
            framing,
            conn_close,
            tx,
            trailers_tx,
            ret_tx,
            shared,
            opts.read_timeout,
        ));

        Ok((
            head,
            H1Body::Stream(BodyChannel::Stream {
                rx,
                trailers: trailers_rx,
            }),
        ))
    }
}

async fn write_deadline<F>(fut: F, timeout: Duration) -> Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(error::write(e)),
        Err(_) => Err(error::timeout(TimeoutPhase::Write)),
    }
}

async fn read_deadline<F, T>(fut: F, timeout: Duration) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(error::timeout(TimeoutPhase::Read)),
    }
}

fn encode_head(
    method: &Method,
    target: &str,
    authority: &str,
    headers: &HeaderMap,
    body_len: Option<u64>,
    absolute_form: bool,
    proxy_auth: Option<&HeaderValue>,
) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    if absolute_form {
        out.extend_from_slice(b"http://");
        out.extend_from_slice(authority.as_bytes());
    }
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(http::header::HOST) {
        out.extend_from_slice(b"host: ");
        out.extend_from_slice(authority.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(auth) = proxy_auth {
        out.extend_from_slice(b"proxy-authorization: ");
        out.extend_from_slice(auth.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    let has_framing =
        headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
    if !has_framing {
        match body_len {
            Some(0) if !method_usually_has_body(method) => {}
            Some(n) => {
                out.extend_from_slice(format!("content-length: {n}\r\n").as_bytes());
            }
            None => {
                out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn method_usually_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

async fn write_body(
    io: &mut BoxedIo,
    body: &mut Body,
    body_len: Option<u64>,
    timeout: Duration,
    shared: &Shared,
) -> Result<()> {
    let chunked = body_len.is_none();
    while let Some(chunk) = body.next_chunk().await {
        let chunk = chunk.map_err(error::write)?;
        if chunk.is_empty() {
            continue;
        }
        if chunked {
            let frame = format!("{:x}\r\n", chunk.len());
            write_deadline(io.write_all(frame.as_bytes()), timeout).await?;
            write_deadline(io.write_all(&chunk), timeout).await?;
            write_deadline(io.write_all(b"\r\n"), timeout).await?;
        } else {
            write_deadline(io.write_all(&chunk), timeout).await?;
        }
        shared.touch();
    }
    if chunked {
        write_deadline(io.write_all(b"0\r\n\r\n"), timeout).await?;
    }
    write_deadline(io.flush(), timeout).await?;
    shared.touch();
    Ok(())
}

async fn fill(io: &mut BoxedIo, buf: &mut BytesMut, shared: &Shared) -> Result<usize> {
    let n = io.read_buf(buf).await.map_err(error::read)?;
    if n > 0 {
        shared.touch();
    }
    Ok(n)
}

async fn read_head(io: &mut BoxedIo, buf: &mut BytesMut, shared: &Shared) -> Result<ResponseHead> {
    loop {
        if !buf.is_empty() {
            if let Some((head, consumed)) = parse_head(buf)? {
                let _ = buf.split_to(consumed);
                return Ok(head);
            }
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(error::protocol("response head exceeds 64 KiB"));
        }
        if fill(io, buf, shared).await? == 0 {
            return Err(error::read("connection closed before response head"));
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                .map_err(|_| error::protocol("invalid status code"))?;
            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for header in parsed.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|e| error::protocol(e))?;
                let value =
                    HeaderValue::from_bytes(header.value).map_err(|e| error::protocol(e))?;
                headers.append(name, value);
            }
            Ok(Some((
                ResponseHead {
                    status,
                    version: Version::HTTP_11,
                    headers,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(error::protocol(e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs to connection close; the transport is not reusable.
    Eof,
}

fn response_framing(method: &Method, head: &ResponseHead) -> Result<Framing> {
    if *method == Method::HEAD
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::Empty);
    }
    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|e| error::protocol(e))?;
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
        return Err(error::protocol(format!("unsupported transfer-encoding {te:?}")));
    }
    if let Some(cl) = head.headers.get(CONTENT_LENGTH) {
        let n: u64 = cl
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| error::protocol("invalid content-length"))?;
        return Ok(if n == 0 { Framing::Empty } else { Framing::Length(n) });
    }
    Ok(Framing::Eof)
}

#[allow(clippy::too_many_arguments)]
async fn pump_body(
    mut io: BoxedIo,
    mut buf: BytesMut,
    framing: Framing,
    conn_close: bool,
    tx: mpsc::Sender<Result<Bytes, Error>>,
    trailers_tx: oneshot::Sender<HeaderMap>,
    ret_tx: oneshot::Sender<IoReturn>,
    shared: Shared,
    read_timeout: Duration,
) {
    let outcome = run_pump(
        &mut io,
        &mut buf,
        framing,
        &tx,
        trailers_tx,
        &shared,
        read_timeout,
    )
    .await;

    let reusable = match outcome {
        Ok(()) => !conn_close && framing != Framing::Eof,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    };
    if reusable {
        let _ = ret_tx.send(IoReturn::Reusable(io, buf));
    } else {
        // A transport that cannot take another request is closed for the
        // pool's purposes; release will discard it.
        shared.close("h1 transport spent");
        let _ = ret_tx.send(IoReturn::Dead);
    }
}

async fn run_pump(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    framing: Framing,
    tx: &mpsc::Sender<Result<Bytes, Error>>,
    trailers_tx: oneshot::Sender<HeaderMap>,
    shared: &Shared,
    read_timeout: Duration,
) -> Result<()> {
    match framing {
        Framing::Empty => Ok(()),
        Framing::Length(mut remaining) => {
            while remaining > 0 {
                if buf.is_empty() {
                    let n = read_deadline(fill(io, buf, shared), read_timeout).await?;
                    if n == 0 {
                        return Err(error::read("connection closed mid-body"));
                    }
                }
                let take = (buf.len() as u64).min(remaining) as usize;
                let chunk = buf.split_to(take).freeze();
                remaining -= chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    return Err(error::read("response body consumer dropped"));
                }
            }
            Ok(())
        }
        Framing::Eof => loop {
            if buf.is_empty() {
                let n = read_deadline(fill(io, buf, shared), read_timeout).await?;
                if n == 0 {
                    return Ok(());
                }
            }
            let chunk = buf.split().freeze();
            if tx.send(Ok(chunk)).await.is_err() {
                return Err(error::read("response body consumer dropped"));
            }
        },
        Framing::Chunked => {
            loop {
                let size = read_chunk_size(io, buf, shared, read_timeout).await?;
                if size == 0 {
                    break;
                }
                let mut remaining = size;
                while remaining > 0 {
                    if buf.is_empty() {
                        let n = read_deadline(fill(io, buf, shared), read_timeout).await?;
                        if n == 0 {
                            return Err(error::read("connection closed mid-chunk"));
                        }
                    }
                    let take = (buf.len() as u64).min(remaining) as usize;
                    let chunk = buf.split_to(take).freeze();
                    remaining -= chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return Err(error::read("response body consumer dropped"));
                    }
                }
                expect_crlf(io, buf, shared, read_timeout).await?;
            }
            // Trailer section ends with an empty line.
            let trailers = read_trailers(io, buf, shared, read_timeout).await?;
            if !trailers.is_empty() {
                let _ = trailers_tx.send(trailers);
            }
            Ok(())
        }
    }
}

async fn read_line(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    shared: &Shared,
    read_timeout: Duration,
) -> Result<BytesMut> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            let _ = buf.split_to(2);
            return Ok(line);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(error::protocol("chunk metadata line too long"));
        }
        let n = read_deadline(fill(io, buf, shared), read_timeout).await?;
        if n == 0 {
            return Err(error::read("connection closed inside chunked framing"));
        }
    }
}

async fn read_chunk_size(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    shared: &Shared,
    read_timeout: Duration,
) -> Result<u64> {
    let line = read_line(io, buf, shared, read_timeout).await?;
    let text = std::str::from_utf8(&line).map_err(|e| error::protocol(e))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16).map_err(|_| error::protocol("invalid chunk size"))
}

async fn expect_crlf(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    shared: &Shared,
    read_timeout: Duration,
) -> Result<()> {
    let line = read_line(io, buf, shared, read_timeout).await?;
    if line.is_empty() {
        Ok(())
    } else {
        Err(error::protocol("missing CRLF after chunk data"))
    }
}

async fn read_trailers(
    io: &mut BoxedIo,
    buf: &mut BytesMut,
    shared: &Shared,
    read_timeout: Duration,
) -> Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    loop {
        let line = read_line(io, buf, shared, read_timeout).await?;
        if line.is_empty() {
            return Ok(trailers);
        }
        let text = std::str::from_utf8(&line).map_err(|e| error::protocol(e))?;
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| error::protocol("malformed trailer line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| error::protocol(e))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| error::protocol(e))?;
        trailers.append(name, value);
    }
}
