//! End-to-end HTTP/2 behavior against an in-process TLS h2 server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use weft::{Client, ClientConfig, RequestOptions, TlsConfig};

fn server_tls_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut &include_bytes!("certs/server.pem")[..])
        .collect::<Result<Vec<_>, _>>()
        .expect("server cert");
    let key = rustls_pemfile::private_key(&mut &include_bytes!("certs/server.key")[..])
        .expect("readable key")
        .expect("server key");
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server tls config");
    config.alpn_protocols = vec![b"h2".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

fn test_client() -> Client {
    let mut cfg = ClientConfig::default();
    cfg.tls = TlsConfig {
        ca_file: Some(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs/ca.pem"),
        ),
        ..TlsConfig::default()
    };
    cfg.proxies_from_env = false;
    // One connection per origin: concurrent requests must multiplex.
    cfg.pool.max_per_origin = 1;
    Client::with_config(cfg).expect("client")
}

/// An h2 echo-ish server. Counts TLS connections; answers GET with a
/// delayed body and extended CONNECT (RFC 8441) with an echo stream.
async fn spawn_h2_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let acceptor = server_tls_acceptor();
    let connections = Arc::new(AtomicUsize::new(0));
    let conn_count = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut builder = h2::server::Builder::new();
                builder.enable_connect_protocol();
                let Ok(mut conn) = builder.handshake::<_, Bytes>(tls).await else {
                    return;
                };
                while let Some(Ok((request, mut respond))) = conn.accept().await {
                    tokio::spawn(async move {
                        if request.method() == Method::CONNECT {
                            // RFC 8441 stream: accept and echo DATA.
                            let response =
                                Response::builder().status(StatusCode::OK).body(()).unwrap();
                            let Ok(mut send) = respond.send_response(response, false) else {
                                return;
                            };
                            let mut body = request.into_body();
                            while let Some(Ok(chunk)) = body.data().await {
                                let _ = body.flow_control().release_capacity(chunk.len());
                                if chunk.is_empty() {
                                    continue;
                                }
                                if send.send_data(chunk, false).is_err() {
                                    return;
                                }
                            }
                            let _ = send.send_data(Bytes::new(), true);
                            return;
                        }

                        let delay_ms: u64 = request
                            .uri()
                            .query()
                            .and_then(|q| q.strip_prefix("delay="))
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        if delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        }
                        let response = Response::builder()
                            .status(StatusCode::OK)
                            .body(())
                            .unwrap();
                        if let Ok(mut send) = respond.send_response(response, false) {
                            let _ = send.send_data(Bytes::from_static(b"h2 payload"), true);
                        }
                    });
                }
            });
        }
    });

    (addr, connections)
}

#[tokio::test]
async fn four_concurrent_gets_share_one_connection() {
    let (addr, connections) = spawn_h2_server().await;
    let client = test_client();
    let base = format!("https://localhost:{}", addr.port());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        // The delay keeps all four streams in flight together.
        let url = format!("{base}/multiplexed?delay=100");
        tasks.push(tokio::spawn(async move {
            let mut response = client
                .request(Method::GET, &url, RequestOptions::new())
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.version(), 20);
            response.bytes().await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().as_ref(), b"h2 payload");
    }

    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "all four streams must share one connection"
    );
}

#[tokio::test]
async fn sequential_requests_reuse_the_idle_multiplexed_connection() {
    let (addr, connections) = spawn_h2_server().await;
    let client = test_client();
    let url = format!("https://localhost:{}/again", addr.port());

    for _ in 0..3 {
        let mut response = client
            .request(Method::GET, &url, RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let _ = response.bytes().await.unwrap();
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rfc8441_websocket_echoes_over_an_h2_stream() {
    let (addr, connections) = spawn_h2_server().await;
    let client = test_client();
    let url = format!("wss+rfc8441://localhost:{}/chat", addr.port());

    let mut response = client
        .request(Method::GET, &url, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), 20);

    let ext = response.extension().expect("extended CONNECT extension");
    ext.send_payload("hi").await.unwrap();
    let echoed = ext.next_payload().await.unwrap().expect("echoed payload");
    assert_eq!(echoed.as_ref(), b"hi");
    ext.ping().await.unwrap();
    ext.close().await.unwrap();
    drop(response);

    // Closing the extension returned the connection to its pool: a second
    // upgrade rides the same transport.
    let mut again = client
        .request(Method::GET, &url, RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
    let ext = again.extension().expect("second extension");
    ext.send_payload("again").await.unwrap();
    assert_eq!(
        ext.next_payload().await.unwrap().expect("echo").as_ref(),
        b"again"
    );
    ext.close().await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}
