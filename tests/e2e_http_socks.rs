//! End-to-end inbound tests.
//!
//! Full chain: client → HTTP/SOCKS inbound → router → direct outbound → target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use babelgate::config::{HttpSocksConfig, Misc, RouteConfig, RuleConfig};
use babelgate::proxy::inbound::http_socks;
use babelgate::router::Router;

fn direct_router() -> Arc<Router> {
    let route = RouteConfig {
        rules: Vec::new(),
        final_policy: "direct".to_string(),
    };
    Arc::new(Router::new(&route, &HashMap::new(), &Misc::default()).unwrap())
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// 204-No-Content origin that answers every request on one connection
async fn spawn_origin() -> std::net::SocketAddr {
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
                    // wait for a full request head before answering
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

async fn start_inbound(auth_user: Option<(&str, &str)>) -> (std::net::SocketAddr, CancellationToken) {
    let port = free_port().await;
    let (username, password) = match auth_user {
        Some((u, p)) => (u.to_string(), p.to_string()),
        None => (String::new(), String::new()),
    };
    let config = HttpSocksConfig {
        host: "127.0.0.1".to_string(),
        port,
        username,
        password,
        system_proxy: false,
    };
    let token = CancellationToken::new();
    {
        let token = token.clone();
        let router = direct_router();
        tokio::spawn(async move {
            let _ = http_socks::serve(&config, router, token).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    (format!("127.0.0.1:{}", port).parse().unwrap(), token)
}

#[tokio::test]
async fn http_connect_through_direct() {
    let origin = spawn_origin().await;
    let (proxy_addr, token) = start_inbound(None).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut reply = [0u8; 19];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    let mut response = [0u8; 27];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");

    token.cancel();
}

#[tokio::test]
async fn socks5_connect_through_direct() {
    let origin = spawn_origin().await;
    let (proxy_addr, token) = start_inbound(None).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let std::net::SocketAddr::V4(origin_v4) = origin else {
        panic!("expected v4 origin");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&origin_v4.ip().octets());
    request.extend_from_slice(&origin_v4.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[..2], [0x05, 0x00]);

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    let mut response = [0u8; 27];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");

    token.cancel();
}

#[tokio::test]
async fn socks5_wrong_password_then_right() {
    let origin = spawn_origin().await;
    let (proxy_addr, token) = start_inbound(Some(("user", "pass"))).await;

    // wrong password: server answers {0x01, 0x01} and drops the connection
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);
    client.write_all(&[0x01, 4]).await.unwrap();
    client.write_all(b"user").await.unwrap();
    client.write_all(&[5]).await.unwrap();
    client.write_all(b"wrong").await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x01]);

    // right password: CONNECT succeeds
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    client.write_all(&[0x01, 4]).await.unwrap();
    client.write_all(b"user").await.unwrap();
    client.write_all(&[4]).await.unwrap();
    client.write_all(b"pass").await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    let std::net::SocketAddr::V4(origin_v4) = origin else {
        panic!("expected v4 origin");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&origin_v4.ip().octets());
    request.extend_from_slice(&origin_v4.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[..2], [0x05, 0x00]);

    token.cancel();
}

#[tokio::test]
async fn plain_http_forward_proxy() {
    let origin = spawn_origin().await;
    let (proxy_addr, token) = start_inbound(None).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET http://{origin}/some/path HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = [0u8; 27];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");

    token.cancel();
}

#[tokio::test]
async fn socks4_is_rejected() {
    let (proxy_addr, token) = start_inbound(None).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x04, 0x01, 0, 80, 1, 2, 3, 4, 0]).await.unwrap();
    // connection is closed without a reply
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    token.cancel();
}

/// 并发查表下热重载规则: 每次查询都只能看到完整的一代规则
#[tokio::test]
async fn live_rule_reload_is_atomic() {
    let route = RouteConfig {
        rules: vec![RuleConfig {
            match_rules: vec!["domain-suffix/example.com".to_string()],
            policy: "reject".to_string(),
        }],
        final_policy: "direct".to_string(),
    };
    let router = Arc::new(Router::new(&route, &HashMap::new(), &Misc::default()).unwrap());

    let mut lookups = Vec::new();
    for _ in 0..4 {
        let router = router.clone();
        lookups.push(tokio::spawn(async move {
            let addr = babelgate::common::Address::Domain("www.example.com".to_string(), 443);
            for _ in 0..5000 {
                // a partially built matcher would yield "direct" here
                assert_eq!(router.pick_policy(&addr), "reject");
            }
        }));
    }

    for _ in 0..50 {
        router.reload_rules().unwrap();
        tokio::task::yield_now().await;
    }
    for lookup in lookups {
        lookup.await.unwrap();
    }
}
