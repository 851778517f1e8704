use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::error::Error;
use crate::common::{Address, ProxyStream, SOCKS_ADDR_TYPES};
use crate::router::Router;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const HELLO_NO_AUTH_REQUIRED: u8 = 0x00;
const HELLO_USERNAME_PASSWORD: u8 = 0x02;

const AUTH_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const REPLY_NO_AUTH: [u8; 2] = [SOCKS5_VERSION, HELLO_NO_AUTH_REQUIRED];
const REPLY_USERNAME_PASSWORD: [u8; 2] = [SOCKS5_VERSION, HELLO_USERNAME_PASSWORD];
const REPLY_NO_ACCEPTABLE_METHODS: [u8; 2] = [SOCKS5_VERSION, 0xFF];

const REPLY_AUTH_SUCCESS: [u8; 2] = [AUTH_VERSION, 0x00];
const REPLY_AUTH_FAILURE: [u8; 2] = [AUTH_VERSION, 0x01];

// BND.ADDR/BND.PORT carry dummy zeros; clients do not use them
const REPLY_SUCCEEDED: [u8; 10] = [SOCKS5_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [SOCKS5_VERSION, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// SOCKS5 入站，版本字节已由外层分发器消费。
///
/// ```text
/// CLIENT_HELLO → AUTH? → CONNECT → RELAY
/// ```
pub async fn handle<S>(
    mut stream: S,
    auth: &Option<(String, String)>,
    router: &Router,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // === 方法协商 ===
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    match auth {
        None if methods.contains(&HELLO_NO_AUTH_REQUIRED) => {
            stream.write_all(&REPLY_NO_AUTH).await?;
        }
        Some((username, password)) if methods.contains(&HELLO_USERNAME_PASSWORD) => {
            stream.write_all(&REPLY_USERNAME_PASSWORD).await?;
            handle_auth_request(&mut stream, username, password).await?;
        }
        _ => {
            stream.write_all(&REPLY_NO_ACCEPTABLE_METHODS).await?;
            return Err(
                Error::ProtocolViolation("unsupported or no acceptable methods".into()).into(),
            );
        }
    }

    // === 连接请求: {VER, CMD, RSV} ===
    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "SOCKS{} protocol is not supported, only SOCKS5 is supported",
            request[0]
        ))
        .into());
    }
    if request[1] != CMD_CONNECT {
        stream.write_all(&REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::ProtocolViolation(format!(
            "the command type {} is not supported, only CONNECT is supported",
            request[1]
        ))
        .into());
    }

    let dest = Address::read_from(&mut stream, SOCKS_ADDR_TYPES).await?;
    stream.write_all(&REPLY_SUCCEEDED).await?;

    debug!(target = %dest, "SOCKS5 CONNECT request");
    let stream: ProxyStream = Box::new(stream);
    crate::proxy::forward_tcp(router, &dest, stream).await
}

/// RFC 1929 用户名/密码子协商
async fn handle_auth_request<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "expected version {} in the client authentication request, but got {}",
            AUTH_VERSION, version
        ))
        .into());
    }
    let got_username = read_length_prefixed(stream).await?;
    let got_password = read_length_prefixed(stream).await?;

    let username_ok = constant_time_eq(&got_username, username.as_bytes());
    let password_ok = constant_time_eq(&got_password, password.as_bytes());
    if !(username_ok & password_ok) {
        stream.write_all(&REPLY_AUTH_FAILURE).await?;
        return Err(Error::AuthFailure("incorrect username or password".into()).into());
    }
    stream.write_all(&REPLY_AUTH_SUCCESS).await?;
    Ok(())
}

async fn read_length_prefixed<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// 不随内容提前返回的比较；长度不同仍直接为假
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Misc, RouteConfig};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::duplex;

    fn test_router() -> Arc<Router> {
        // every destination rejects, so handlers stop right after the handshake
        let route = RouteConfig {
            rules: Vec::new(),
            final_policy: "reject".to_string(),
        };
        Arc::new(Router::new(&route, &HashMap::new(), &Misc::default()).unwrap())
    }

    #[tokio::test]
    async fn no_auth_connect_handshake() {
        let (mut client, server) = duplex(4096);
        let router = test_router();
        let task = tokio::spawn(async move { handle(server, &None, &router).await });

        // NMETHODS=1, METHODS=[no-auth] (version byte already consumed upstream)
        client.write_all(&[0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // CONNECT example.com:80
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm'])
            .await
            .unwrap();
        client.write_all(&80u16.to_be_bytes()).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, REPLY_SUCCEEDED);

        // reject outbound terminates the task with an error after the reply
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn auth_success_then_connect() {
        let (mut client, server) = duplex(4096);
        let router = test_router();
        let auth = Some(("user".to_string(), "pass".to_string()));
        let task = tokio::spawn(async move { handle(server, &auth, &router).await });

        client.write_all(&[0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        // VER=1, ULEN, "user", PLEN, "pass"
        client.write_all(&[0x01, 4]).await.unwrap();
        client.write_all(b"user").await.unwrap();
        client.write_all(&[4]).await.unwrap();
        client.write_all(b"pass").await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4])
            .await
            .unwrap();
        client.write_all(&443u16.to_be_bytes()).await.unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply, REPLY_SUCCEEDED);
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_gets_failure_reply() {
        let (mut client, server) = duplex(4096);
        let router = test_router();
        let auth = Some(("user".to_string(), "pass".to_string()));
        let task = tokio::spawn(async move { handle(server, &auth, &router).await });

        client.write_all(&[0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client.write_all(&[0x01, 4]).await.unwrap();
        client.write_all(b"user").await.unwrap();
        client.write_all(&[5]).await.unwrap();
        client.write_all(b"wrong").await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn no_acceptable_methods() {
        let (mut client, server) = duplex(4096);
        let router = test_router();
        // auth required but client only offers no-auth
        let auth = Some(("user".to_string(), "pass".to_string()));
        let task = tokio::spawn(async move { handle(server, &auth, &router).await });

        client.write_all(&[0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn non_connect_command_rejected() {
        let (mut client, server) = duplex(4096);
        let router = test_router();
        let task = tokio::spawn(async move { handle(server, &None, &router).await });

        client.write_all(&[0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // UDP ASSOCIATE
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply, REPLY_COMMAND_NOT_SUPPORTED);
        assert!(task.await.unwrap().is_err());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
