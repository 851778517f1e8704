//! Carrier end-to-end tests over real sockets.
//!
//! Each carrier runs its server half against a router with a direct final
//! policy, and its client half dials a local origin through it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use babelgate::config::{HgConfig, Misc, Password, ProxyNode, RouteConfig, TlsCertKeyPair};
use babelgate::common::Address;
use babelgate::proxy::inbound;
use babelgate::proxy::outbound::aead::AeadClient;
use babelgate::proxy::outbound::tls_carrier::TlsCarrierClient;
use babelgate::proxy::outbound::tuic::{TuicClient, QUIC_ALPN};
use babelgate::router::Router;

const PASSWORD_HEX: &str = "000102030405060708090a0b0c0d0e0f";

fn password() -> Password {
    serde_json::from_str(&format!("\"{}\"", PASSWORD_HEX)).unwrap()
}

fn direct_router() -> Arc<Router> {
    let route = RouteConfig {
        rules: Vec::new(),
        final_policy: "direct".to_string(),
    };
    Arc::new(Router::new(&route, &HashMap::new(), &Misc::default()).unwrap())
}

/// 整个测试进程共享一份自签名证书，
/// 与按 host 缓存的 TLS 客户端配置保持一致
fn shared_cert() -> &'static (PathBuf, PathBuf) {
    static CERT: OnceLock<(PathBuf, PathBuf)> = OnceLock::new();
    CERT.get_or_init(|| {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap().keep();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    })
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if !buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                        continue;
                    }
                    if stream
                        .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn hg_config(tls_port: u16, tcp_port: Option<u16>, quic_port: Option<u16>) -> HgConfig {
    let (cert, key) = shared_cert().clone();
    let pair_str = format!("\"{} {}\"", cert.display(), key.display());
    let pair: TlsCertKeyPair = serde_json::from_str(&pair_str).unwrap();
    HgConfig {
        host: "localhost".to_string(),
        password: password(),
        tls_port,
        tcp_port,
        quic_port,
        tls_cert_key_pair: Some(pair),
        tls_bad_auth_fallback_site_dir: None,
    }
}

fn node(tls_port: u16, tcp_port: Option<u16>, quic_port: Option<u16>) -> ProxyNode {
    ProxyNode {
        host: "localhost".to_string(),
        password: password(),
        tls_port,
        tcp_port,
        quic_port,
        tls_cert: Some(shared_cert().0.clone()),
    }
}

async fn request_through(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
) {
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let mut response = [0u8; 27];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn aead_carrier_end_to_end() {
    let origin = spawn_origin().await;
    let tcp_port = free_port().await;
    let hg = hg_config(free_port().await, Some(tcp_port), None);
    let token = CancellationToken::new();
    {
        let hg = hg.clone();
        let router = direct_router();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = inbound::aead::serve(&hg, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = AeadClient::new(&node(443, Some(tcp_port), None)).unwrap();
    let mut stream = client.dial(&Address::Ip(origin)).await.unwrap();
    request_through(&mut stream).await;
    token.cancel();
}

#[tokio::test]
async fn tls_carrier_end_to_end() {
    let origin = spawn_origin().await;
    let tls_port = free_port().await;
    let hg = hg_config(tls_port, None, None);
    let token = CancellationToken::new();
    {
        let hg = hg.clone();
        let router = direct_router();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = inbound::tls_carrier::serve(&hg, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = TlsCarrierClient::new(&node(tls_port, None, None), false).unwrap();
    let mut stream = client.dial(&Address::Ip(origin)).await.unwrap();
    request_through(&mut stream).await;
    token.cancel();
}

#[tokio::test]
async fn tls_carrier_bad_auth_gets_http_fallback() {
    let tls_port = free_port().await;
    let hg = hg_config(tls_port, None, None);
    let token = CancellationToken::new();
    {
        let hg = hg.clone();
        let router = direct_router();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = inbound::tls_carrier::serve(&hg, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // a plain HTTPS client with the wrong "password" (an HTTP request line)
    let mut roots = rustls::RootCertStore::empty();
    let cert_pem = std::fs::read(&shared_cert().0).unwrap();
    for cert in rustls_pemfile::certs(&mut cert_pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", tls_port))
        .await
        .unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut stream = connector.connect(server_name, tcp).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // the fallback site answers like any web server would (404, no site dir)
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 404"),
        "unexpected fallback response: {}",
        response
    );
    token.cancel();
}

#[tokio::test]
async fn tuic_carrier_end_to_end() {
    let origin = spawn_origin().await;
    let quic_port = free_port().await;
    let hg = hg_config(free_port().await, None, Some(quic_port));
    let token = CancellationToken::new();
    {
        let hg = hg.clone();
        let router = direct_router();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = inbound::tuic::serve(&hg, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = TuicClient::new(&node(443, None, Some(quic_port)), false).unwrap();
    let mut stream = client.dial(&Address::Ip(origin)).await.unwrap();
    request_through(&mut stream).await;

    // the connection is shared across requests
    let mut stream = client.dial(&Address::Ip(origin)).await.unwrap();
    request_through(&mut stream).await;
    token.cancel();
}

#[tokio::test]
async fn tuic_auth_timeout_closes_connection() {
    let quic_port = free_port().await;
    let hg = hg_config(free_port().await, None, Some(quic_port));
    let token = CancellationToken::new();
    {
        let hg = hg.clone();
        let router = direct_router();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = inbound::tuic::serve(&hg, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // a QUIC client that never sends the authentication command
    let mut roots = rustls::RootCertStore::empty();
    let cert_pem = std::fs::read(&shared_cert().0).unwrap();
    for cert in rustls_pemfile::certs(&mut cert_pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![QUIC_ALPN.to_vec()];
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap(),
    )));

    let conn = endpoint
        .connect(
            format!("127.0.0.1:{}", quic_port).parse().unwrap(),
            "localhost",
        )
        .unwrap()
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(10), conn.closed())
        .await
        .expect("server should close the connection after the auth deadline");
    match reason {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(close.error_code, quinn::VarInt::from_u32(0x01));
        }
        other => panic!("unexpected close reason: {:?}", other),
    }
    token.cancel();
}
