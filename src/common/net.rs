use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::addr::Address;
use crate::common::error::Error;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(1000);

/// 向目标地址发起 TCP 连接，超时 10 秒
pub async fn dial_tcp(addr: &Address) -> Result<TcpStream> {
    dial_tcp_host(&addr.to_string()).await
}

/// 向 `host:port` 发起 TCP 连接，超时 10 秒
pub async fn dial_tcp_host(host_port: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(host_port))
        .await
        .map_err(|_| {
            Error::UpstreamFailure(format!("connect timeout after 10s to {}", host_port))
        })?
        .map_err(|e| Error::UpstreamFailure(format!("fail to connect to {}: {}", host_port, e)))?;
    stream.set_nodelay(true)?;
    apply_keepalive(&stream)?;
    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    Ok(())
}

/// 监听 TCP 并为每条连接派生一个任务。
///
/// accept 出错时记录并继续；监听本身失败对该组件是致命的。
/// `token` 取消后 accept 循环退出，进行中的连接任务随之结束。
pub async fn serve_tcp<H, Fut>(
    token: CancellationToken,
    addr: SocketAddr,
    name: &'static str,
    handler: H,
) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("fail to listen on {} for {}", addr, name))?;
    info!(addr = %listener.local_addr()?, "{} listening", name);

    loop {
        let (conn, peer) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    info!(error = %e, "{}: fail to accept a connection", name);
                    continue;
                }
            },
        };
        let _ = apply_keepalive(&conn);

        let handler = handler.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                res = handler(conn, peer) => {
                    if let Err(e) = res {
                        info!(source = %peer, error = %e, "{}: fail to handle a request", name);
                    }
                }
            }
        });
    }
}
