use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::error::Error;
use crate::common::{net, PrefixedStream, ProxyStream};
use crate::config::HttpSocksConfig;
use crate::proxy::inbound::{http, socks5};
use crate::router::Router;

/// HTTP/SOCKS 混合入站。
///
/// 读首字节分流: 0x04 拒绝（不支持 SOCKS4），0x05 进入 SOCKS5，
/// 其余按 HTTP 处理并把该字节放回流前。
pub async fn serve(
    config: &HttpSocksConfig,
    router: Arc<Router>,
    token: CancellationToken,
) -> Result<()> {
    if config.system_proxy {
        warn!("'system-proxy' is not available in this build; ignoring");
    }
    let auth = Arc::new(config.auth());

    let handler = {
        let router = router.clone();
        let auth = auth.clone();
        move |conn: TcpStream, peer: SocketAddr| {
            let router = router.clone();
            let auth = auth.clone();
            async move { handle_connection(conn, peer, &auth, &router).await }
        }
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| Error::BadConfig(format!("invalid 'http-socks' host '{}'", config.host)))?;
    let addr = SocketAddr::new(host, config.port);

    // 监听 `::1` 时无法同时覆盖 IPv4 环回，于是再挂一个 127.0.0.1 的监听；
    // `::` 则交给平台的双栈默认行为
    if config.host == "::1" {
        let secondary = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), config.port);
        let primary_task = net::serve_tcp(token.clone(), addr, "HTTP/SOCKS", handler.clone());
        let secondary_task = net::serve_tcp(token, secondary, "HTTP/SOCKS", handler);
        tokio::try_join!(primary_task, secondary_task)?;
        Ok(())
    } else {
        net::serve_tcp(token, addr, "HTTP/SOCKS", handler).await
    }
}

async fn handle_connection(
    mut conn: TcpStream,
    peer: SocketAddr,
    auth: &Option<(String, String)>,
    router: &Router,
) -> Result<()> {
    let first_byte = conn.read_u8().await?;
    match first_byte {
        socks5::SOCKS4_VERSION => {
            info!(source = %peer, inbound = "SOCKS4", policy = "unsupported & rejected", "route");
            Err(Error::ProtocolViolation(
                "SOCKS4 protocol is not supported, only SOCKS5 is supported".into(),
            )
            .into())
        }
        socks5::SOCKS5_VERSION => socks5::handle(conn, auth, router).await,
        other => {
            // assume an HTTP proxy request; the consumed byte is preloaded back
            let stream: ProxyStream =
                Box::new(PrefixedStream::new(vec![other], Box::new(conn)));
            http::handle(stream, auth, router).await
        }
    }
}
