use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use crate::common::error::Error;
use crate::common::{net, tls, Address, PrefixedStream, ProxyStream, SOCKS_ADDR_TYPES};
use crate::config::HgConfig;
use crate::proxy::outbound::tls_carrier::{escape_crlf, trojan_password, CMD_CONNECT};
use crate::router::Router;

/// 首行（密码行）的最大长度，含 CRLF
const MAX_AUTH_LINE_SIZE: u64 = 128;

pub struct ServerAuth {
    password_escaped: [u8; 16],
    trojan_password: [u8; 56],
}

impl ServerAuth {
    pub fn new(password_raw: [u8; 16], password_hex: &str) -> Self {
        Self {
            password_escaped: escape_crlf(password_raw),
            trojan_password: trojan_password(password_hex),
        }
    }
}

pub enum Handshake {
    /// 认证通过，转发到解析出的目标
    Authed { dest: Address },
    /// 认证失败，整条连接（含已消费字节）转发到本地静态站点
    Fallback,
}

/// TLS 载体服务端。
///
/// 认证失败的连接被原样接到一个本地静态 HTTP 站点上，
/// 使探测者只能看到一个普通的 HTTPS 网站。
pub async fn serve(hg: &HgConfig, router: Arc<Router>, token: CancellationToken) -> Result<()> {
    let pair = hg
        .tls_cert_key_pair
        .as_ref()
        .ok_or_else(|| Error::BadConfig("TLS carrier server needs 'tls-cert-key-pair'".into()))?;
    let tls_config = tls::server_config(&pair.cert_file, &pair.key_file)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let auth = Arc::new(ServerAuth::new(hg.password.raw, &hg.password.hex));

    let fallback_port =
        start_fallback_site(hg.tls_bad_auth_fallback_site_dir.clone()).await?;
    let fallback_addr = Address::Ip(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), fallback_port));

    let listen = SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), hg.tls_port);
    net::serve_tcp(token, listen, "TLS carrier", move |conn, peer| {
        let acceptor = acceptor.clone();
        let auth = auth.clone();
        let router = router.clone();
        let fallback_addr = fallback_addr.clone();
        async move {
            let stream = acceptor.accept(conn).await?;
            let (handshake, stream) = read_handshake(stream, &auth).await?;
            match handshake {
                Handshake::Authed { dest } => {
                    debug!(source = %peer, target = %dest, "TLS carrier request accepted");
                    crate::proxy::forward_tcp(&router, &dest, stream).await
                }
                Handshake::Fallback => {
                    info!(source = %peer, "TLS carrier with wrong auth");
                    crate::proxy::forward_tcp(&router, &fallback_addr, stream).await
                }
            }
        }
    })
    .await
}

/// 读首行并认证。
///
/// 两种合法取值: 16 字节转义密码，或 56 字节十六进制的
/// SHA-224（Trojan 兼容，地址后多读一个 CRLF）。其余输入进入回落分支，
/// 已消费的字节被拼接回流前，使回落站点收到完整的原始请求。
pub async fn read_handshake<S>(stream: S, auth: &ServerAuth) -> Result<(Handshake, ProxyStream)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(stream);

    let mut raw_line = Vec::new();
    (&mut reader)
        .take(MAX_AUTH_LINE_SIZE)
        .read_until(b'\n', &mut raw_line)
        .await?;

    let line = strip_line_ending(&raw_line);
    let is_native = line.len() == 16 && line == auth.password_escaped;
    let is_trojan = !is_native && line.len() == 56 && line == auth.trojan_password;

    if !is_native && !is_trojan {
        let mut preload = raw_line;
        preload.extend_from_slice(reader.buffer());
        let inner = reader.into_inner();
        let stream: ProxyStream = Box::new(PrefixedStream::new(preload, Box::new(inner)));
        return Ok((Handshake::Fallback, stream));
    }

    let command = reader.read_u8().await?;
    if command != CMD_CONNECT {
        return Err(
            Error::ProtocolViolation(format!("unsupported command type {}", command)).into(),
        );
    }
    let dest = Address::read_from(&mut reader, SOCKS_ADDR_TYPES).await?;
    if is_trojan {
        // the Trojan protocol carries a second CRLF after the request
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }

    let preload = reader.buffer().to_vec();
    let inner = reader.into_inner();
    let stream: ProxyStream = Box::new(PrefixedStream::new(preload, Box::new(inner)));
    Ok((Handshake::Authed { dest }, stream))
}

fn strip_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// 在环回地址上启动认证回落用的静态站点；未配置目录时一律 404
async fn start_fallback_site(dir: Option<PathBuf>) -> Result<u16> {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();

    let app = match dir {
        Some(dir) => axum::Router::new().fallback_service(ServeDir::new(dir)),
        None => axum::Router::new(),
    }
    .layer(TimeoutLayer::new(Duration::from_secs(10)));

    info!(port = port, "bad-auth fallback site listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "fail to serve the fallback site");
        }
    });
    Ok(port)
}
