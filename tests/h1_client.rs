//! End-to-end HTTP/1.1 behavior against a scripted loopback server.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use weft::{Client, ClientConfig, RequestOptions, Retry};

/// A client that ignores ambient proxy environment variables.
fn plain_client() -> Client {
    let mut cfg = ClientConfig::default();
    cfg.proxies_from_env = false;
    Client::with_config(cfg).expect("client")
}

#[tokio::test]
async fn happy_get_honors_content_length_and_pools_the_connection() {
    let server = support::spawn(|request, mut stream| async move {
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/robots.txt");
        assert!(request.header("host").is_some());
        support::respond(&mut stream, 200, "OK", b"User-agent: *\n").await;
        Some(stream)
    })
    .await;

    let client = plain_client();
    let mut response = client
        .request(Method::GET, &server.url("/robots.txt"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), 11);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"User-agent: *\n");

    // Second request reuses the pooled connection.
    let mut second = client
        .request(Method::GET, &server.url("/robots.txt"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let _ = second.bytes().await.unwrap();

    assert_eq!(server.request_count(), 2);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn redirect_scrubs_authorization_across_origins() {
    // Two listeners = two origins (different ports on 127.0.0.1).
    let target = support::spawn(|request, mut stream| async move {
        assert!(request.header("authorization").is_none());
        support::respond(&mut stream, 200, "OK", b"made it").await;
        Some(stream)
    })
    .await;

    let target_url = target.url("/landing");
    let source = support::spawn(move |_request, mut stream| {
        let location = target_url.clone();
        async move {
            support::respond_with_headers(
                &mut stream,
                302,
                "Found",
                &[("location", location.as_str())],
                b"",
            )
            .await;
            Some(stream)
        }
    })
    .await;

    let client = plain_client();
    let opts = RequestOptions::new()
        .header("authorization", "Bearer sekrit")
        .unwrap();
    let mut response = client
        .request(Method::GET, &source.url("/start"), opts)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"made it");
    assert_eq!(target.request_count(), 1);
}

#[tokio::test]
async fn post_is_not_retried_after_request_bytes_were_sent() {
    let server = support::spawn(|_request, stream| async move {
        // Request fully read, then the connection dies with no response.
        drop(stream);
        None
    })
    .await;

    let client = plain_client();
    let opts = RequestOptions::new().body("payload");
    let err = client
        .request(Method::POST, &server.url("/submit"), opts)
        .await
        .unwrap_err();
    assert!(err.is_read());
    assert!(!err.is_max_retry(), "POST must surface, not exhaust retries");
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn idempotent_get_retries_through_server_failures() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let server = support::spawn(move |_request, mut stream| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                drop(stream);
                return None;
            }
            support::respond(&mut stream, 200, "OK", b"recovered").await;
            Some(stream)
        }
    })
    .await;

    let client = plain_client();
    // First attempt opens a fresh connection and dies after send; GET is
    // idempotent so the read retry kicks in.
    let mut response = client
        .request(Method::GET, &server.url("/flaky"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"recovered");
    assert_eq!(server.request_count(), 2);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn retry_after_is_honored_between_attempts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let server = support::spawn(move |_request, mut stream| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                support::respond_with_headers(
                    &mut stream,
                    503,
                    "Service Unavailable",
                    &[("retry-after", "1")],
                    b"try later",
                )
                .await;
            } else {
                support::respond(&mut stream, 200, "OK", b"finally").await;
            }
            Some(stream)
        }
    })
    .await;

    let client = plain_client();
    let opts = RequestOptions::new().retries(Retry::new(3).with_status_forcelist([503]));
    let started = Instant::now();
    let mut response = client
        .request(Method::GET, &server.url("/busy"), opts)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"finally");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(
        elapsed >= Duration::from_secs(2),
        "two Retry-After waits of 1s each, got {elapsed:?}"
    );
}

#[tokio::test]
async fn streaming_body_cannot_follow_a_307_redirect() {
    let server = support::spawn(|_request, mut stream| async move {
        support::respond_with_headers(
            &mut stream,
            307,
            "Temporary Redirect",
            &[("location", "/moved")],
            b"",
        )
        .await;
        Some(stream)
    })
    .await;

    let client = plain_client();
    let (sender, body) = weft::Body::channel(Some(4));
    let feeder = tokio::spawn(async move {
        let _ = sender.send("data").await;
    });

    let err = client
        .request(
            Method::PUT,
            &server.url("/upload"),
            RequestOptions::new().body(body),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), weft::Kind::Redirect));
    let _ = feeder.await;
    assert_eq!(server.request_count(), 1, "the hop must not be taken");
}

#[tokio::test]
async fn zero_timeout_fails_immediately() {
    let client = plain_client();
    let err = client
        .request(
            Method::GET,
            "http://192.0.2.1/never",
            RequestOptions::new().timeout(Duration::ZERO),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn chunked_body_streams_and_trailers_arrive_after_body() {
    let server = support::spawn(|_request, mut stream| async move {
        let payload = b"HTTP/1.1 200 OK\r\n\
            transfer-encoding: chunked\r\n\
            trailer: x-checksum\r\n\r\n\
            5\r\nhello\r\n6\r\n world\r\n0\r\nx-checksum: abc123\r\n\r\n";
        let _ = stream.write_all(payload).await;
        let _ = stream.flush().await;
        Some(stream)
    })
    .await;

    let client = plain_client();
    let mut response = client
        .open(Method::GET, &server.url("/chunked"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.trailers().is_none(), "trailers only after body");

    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), b"hello world");
    assert_eq!(response.trailers().unwrap()["x-checksum"], "abc123");
}

#[tokio::test]
async fn expect_continue_waits_for_interim_response() {
    let server = support::spawn(|request, mut stream| async move {
        // The support reader consumed the body only if content-length was
        // satisfied; with 100-continue the client sent headers first, so
        // the body may arrive after we ack.
        if request.header("expect").is_some() && request.body.len() < 7 {
            let _ = stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await;
            let mut body = vec![0u8; 7 - request.body.len()];
            let _ = stream.read_exact(&mut body).await;
        }
        support::respond(&mut stream, 200, "OK", b"accepted").await;
        Some(stream)
    })
    .await;

    let client = plain_client();
    let opts = RequestOptions::new()
        .header("expect", "100-continue")
        .unwrap()
        .body("payload");
    let mut response = client
        .request(Method::POST, &server.url("/upload"), opts)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"accepted");
}

#[tokio::test]
async fn websocket_upgrade_exposes_echoing_extension() {
    let server = support::spawn(|request, mut stream| async move {
        assert_eq!(request.method, "GET");
        assert!(request
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket")));
        assert!(request.header("sec-websocket-key").is_some());

        let _ = stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  upgrade: websocket\r\n\
                  connection: Upgrade\r\n\r\n",
            )
            .await;

        // Raw echo until the peer shuts down.
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return None;
                    }
                }
            }
        }
    })
    .await;

    let client = plain_client();
    let mut response = client
        .request(Method::GET, &server.ws_url("/echo"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    let ext = response.extension().expect("upgrade provides extension");
    ext.send_payload("hi").await.unwrap();
    let echoed = ext.next_payload().await.unwrap().expect("echo payload");
    assert_eq!(echoed.as_ref(), b"hi");
    ext.ping().await.unwrap();
    ext.close().await.unwrap();
}

#[tokio::test]
async fn gzip_response_is_transparently_decoded() {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"squeezed").unwrap();
    let compressed = encoder.finish().unwrap();

    let server = support::spawn(move |request, mut stream| {
        let compressed = compressed.clone();
        async move {
            assert!(request
                .header("accept-encoding")
                .is_some_and(|v| v.contains("gzip")));
            support::respond_with_headers(
                &mut stream,
                200,
                "OK",
                &[("content-encoding", "gzip")],
                &compressed,
            )
            .await;
            Some(stream)
        }
    })
    .await;

    let client = plain_client();
    let mut response = client
        .request(Method::GET, &server.url("/compressed"), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"squeezed");
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let client = plain_client();
    client.close();
    let err = client
        .request(Method::GET, "http://example.com/", RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        weft::Kind::Pool(weft::PoolReason::Shutdown)
    ));
}
