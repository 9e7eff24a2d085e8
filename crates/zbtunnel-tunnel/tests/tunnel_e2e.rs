//! End-to-end tunnel tests against loopback upstreams

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use zbtunnel_codec::CoderPool;
use zbtunnel_config::{ChainConfig, GlobalConfig};
use zbtunnel_tunnel::Tunnel;

async fn echo_server(accepts: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn round_trip(tunnel_addr: SocketAddr, payload: &[u8]) {
    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn raw_passthrough_echoes_across_sizes() {
    let upstream = echo_server(Arc::new(AtomicUsize::new(0))).await;
    let chain = ChainConfig::from_hops(vec![vec![
        ("host", upstream.ip().to_string()),
        ("port", upstream.port().to_string()),
        ("local_port", "0".to_owned()),
    ]]);

    let mut tunnel = Tunnel::spawn_socket(
        "raw",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    )
    .unwrap();
    let addr = tunnel.local_addr().unwrap();

    round_trip(addr, b"hello").await;
    round_trip(addr, &[0x42]).await;
    let big: Vec<u8> = (0..65536).map(|i| (i % 251) as u8).collect();
    round_trip(addr, &big).await;

    tunnel.stop();
    tunnel.join();
}

/// An upstream speaking the shadow framing: consume the (encoded) request
/// frame, then echo. The substitution tables are their own mirror here, so
/// echoing the raw payload bytes sends back exactly what the tunnel's
/// decoder expects.
async fn shadow_echo_server(key: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let coders = CoderPool::new();
        let coder = coders.get("", key).unwrap();
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let coder = Arc::clone(&coder);
            tokio::spawn(async move {
                let mut header = [0u8; 2];
                stream.read_exact(&mut header).await.unwrap();
                coder.decrypt(&mut header);
                assert_eq!(header[0], 0x03);

                let mut target = vec![0u8; header[1] as usize + 2];
                stream.read_exact(&mut target).await.unwrap();
                coder.decrypt(&mut target);
                let host = String::from_utf8_lossy(&target[..header[1] as usize]).into_owned();
                assert_eq!(host, "echo.internal");

                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn shadow_chain_round_trips() {
    let upstream = shadow_echo_server("e2e-key").await;
    let chain = ChainConfig::from_hops(vec![
        vec![
            ("transport", "shadow".to_owned()),
            ("key", "e2e-key".to_owned()),
            ("host", upstream.ip().to_string()),
            ("port", upstream.port().to_string()),
            ("local_port", "0".to_owned()),
        ],
        vec![
            ("host", "echo.internal".to_owned()),
            ("port", "9000".to_owned()),
        ],
    ]);

    let mut tunnel = Tunnel::spawn_socket(
        "shadow",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    )
    .unwrap();
    let addr = tunnel.local_addr().unwrap();

    round_trip(addr, b"ping through the cipher").await;

    tunnel.stop();
    tunnel.join();
}

#[tokio::test]
async fn http_connect_chain_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    stream.read_exact(&mut byte).await.unwrap();
                    request.push(byte[0]);
                }
                assert!(request.starts_with(b"CONNECT example.com:80 HTTP/1.1\r\n"));
                stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .unwrap();

                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let chain = ChainConfig::from_hops(vec![
        vec![
            ("transport", "http".to_owned()),
            ("host", proxy_addr.ip().to_string()),
            ("port", proxy_addr.port().to_string()),
            ("local_port", "0".to_owned()),
        ],
        vec![
            ("host", "example.com".to_owned()),
            ("port", "80".to_owned()),
        ],
    ]);

    let mut tunnel = Tunnel::spawn_socket(
        "http",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    )
    .unwrap();
    let addr = tunnel.local_addr().unwrap();

    round_trip(addr, b"ping").await;

    tunnel.stop();
    tunnel.join();
}

#[tokio::test]
async fn recycling_caps_upstream_connections() {
    let accepts = Arc::new(AtomicUsize::new(0));
    let upstream = echo_server(Arc::clone(&accepts)).await;
    let chain = ChainConfig::from_hops(vec![vec![
        ("host", upstream.ip().to_string()),
        ("port", upstream.port().to_string()),
        ("local_port", "0".to_owned()),
        ("recycle", "true".to_owned()),
        ("preconnect", "1".to_owned()),
        ("max_reuse", "2".to_owned()),
    ]]);

    let mut tunnel = Tunnel::spawn_socket(
        "pooled",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    )
    .unwrap();
    let addr = tunnel.local_addr().unwrap();

    for _ in 0..6 {
        round_trip(addr, b"probe").await;

        // Wait for the served connection to return to the pool, so the next
        // client reuses it instead of racing a fresh one.
        tokio::time::timeout(Duration::from_secs(5), async {
            while tunnel.reusable_connections() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(tunnel.reusable_connections() <= 2);
    }

    // One eagerly served connection plus one preconnected spare.
    assert!(accepts.load(Ordering::SeqCst) <= 4);

    tunnel.stop();
    tunnel.join();
}

#[tokio::test]
async fn unknown_transport_fails_at_spawn() {
    let chain = ChainConfig::from_hops(vec![vec![
        ("transport", "quic"),
        ("host", "127.0.0.1"),
        ("port", "1"),
        ("local_port", "0"),
    ]]);
    let result = Tunnel::spawn_socket(
        "bad",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn bind_conflict_is_a_tunnel_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let chain = ChainConfig::from_hops(vec![vec![
        ("host", "127.0.0.1".to_owned()),
        ("port", "9".to_owned()),
        ("local_port", port.to_string()),
    ]]);
    let result = Tunnel::spawn_socket(
        "conflict",
        chain,
        &GlobalConfig::default(),
        Arc::new(CoderPool::new()),
    );
    assert!(result.is_err());
}
