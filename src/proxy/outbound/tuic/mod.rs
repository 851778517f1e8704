use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use quinn::VarInt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

use crate::common::error::Error;
use crate::common::{tls, Address, AddrTypes, ProxyStream};
use crate::config::ProxyNode;

pub const TUIC_VERSION: u8 = 5;

pub const CMD_AUTHENTICATE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_HEARTBEAT: u8 = 0x04;

/// 认证命令的 UUID 字段，固定 16 字节，同时用作 TLS exporter 的 label
pub const AUTH_UUID: &[u8; 16] = b"EXPORTER_hg_QUIC";
pub const AUTH_TOKEN_SIZE: usize = 32;

/// 服务端等待认证命令的期限
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(7);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(720);
const QUIC_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const ERR_CODE_AUTH_SEND: u32 = 0x00;
pub const ERR_CODE_AUTH_TIMEOUT: u32 = 0x01;
pub const ERR_CODE_CONNECT_SEND: u32 = 0x10;
pub const ERR_CODE_STREAM: u32 = 0x100;
pub const ERR_CODE_HEARTBEAT_SEND: u32 = 0x101;

/// TUIC 地址表: Domain=0x00, IPv4=0x01, IPv6=0x02 (None=0xff 不参与编码)
pub const TUIC_ADDR_TYPES: AddrTypes = AddrTypes {
    ipv4: 0x01,
    ipv6: 0x02,
    domain: 0x00,
};

/// rustls 的 QUIC 会话必须带 ALPN
pub const QUIC_ALPN: &[u8] = b"h3";

/// TOKEN = TLS-Exporter(label = UUID, context = password 字符串, 32 字节)
pub fn auth_token(conn: &quinn::Connection, password_hex: &str) -> Result<[u8; AUTH_TOKEN_SIZE]> {
    let mut token = [0u8; AUTH_TOKEN_SIZE];
    conn.export_keying_material(&mut token, AUTH_UUID, password_hex.as_bytes())
        .map_err(|_| Error::AuthFailure("fail to export TLS keying material".into()))?;
    Ok(token)
}

/// VER(5) ‖ CMD(1) ‖ ATYP ‖ ADDR ‖ PORT
pub fn encode_connect_command(dest: &Address) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + dest.encoded_len());
    buf.put_u8(TUIC_VERSION);
    buf.put_u8(CMD_CONNECT);
    dest.encode(&mut buf, TUIC_ADDR_TYPES);
    buf
}

/// TUIC 客户端: 每个远端复用一条长期 QUIC 连接，失败后重建。
pub struct TuicClient {
    host: String,
    quic_port: u16,
    password_hex: String,
    tls_config: Arc<rustls::ClientConfig>,
    conn: tokio::sync::Mutex<Option<ActiveConn>>,
}

#[derive(Clone)]
struct ActiveConn {
    conn: quinn::Connection,
    relaying_tasks: Arc<AtomicU64>,
    // keeps the UDP driver alive for as long as the connection is held
    _endpoint: quinn::Endpoint,
}

impl TuicClient {
    pub fn new(node: &ProxyNode, tls_key_log: bool) -> Result<Self> {
        let quic_port = node
            .quic_port
            .ok_or_else(|| Error::BadConfig("TUIC outbound missing 'quic-port'".into()))?;
        let tls_config = tls::client_config(&node.host, node.tls_cert.as_deref(), tls_key_log)?;
        Ok(Self {
            host: node.host.clone(),
            quic_port,
            password_hex: node.password.hex.clone(),
            tls_config,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        let active = self.active_conn().await?;
        let (send, recv) = match active.conn.open_bi().await {
            Ok(pair) => pair,
            Err(e) => {
                // a broken connection is nulled so the next caller rebuilds
                let mut guard = self.conn.lock().await;
                if let Some(current) = guard.as_ref() {
                    if current.conn.stable_id() == active.conn.stable_id() {
                        *guard = None;
                    }
                }
                return Err(Error::UpstreamFailure(format!(
                    "fail to open a QUIC stream: {}",
                    e
                ))
                .into());
            }
        };

        debug!(target = %addr, "TUIC stream opened");
        active.relaying_tasks.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(TuicStream::new_client(
            send,
            recv,
            encode_connect_command(addr),
            active.conn.clone(),
            active.relaying_tasks.clone(),
        )))
    }

    async fn active_conn(&self) -> Result<ActiveConn> {
        let mut guard = self.conn.lock().await;
        if let Some(active) = guard.as_ref() {
            if active.conn.close_reason().is_none() {
                return Ok(active.clone());
            }
        }
        *guard = None;
        let active = self.connect().await.map_err(|e| {
            Error::UpstreamFailure(format!(
                "fail to connect to the QUIC server {}:{}: {}",
                self.host, self.quic_port, e
            ))
        })?;
        *guard = Some(active.clone());
        Ok(active)
    }

    async fn connect(&self) -> Result<ActiveConn> {
        let server_addr = tokio::net::lookup_host((self.host.as_str(), self.quic_port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::BadAddress(format!("failed to resolve {}:{}", self.host, self.quic_port))
            })?;

        let bind: SocketAddr = if server_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;

        let mut tls_config = self.tls_config.as_ref().clone();
        tls_config.alpn_protocols = vec![QUIC_ALPN.to_vec()];
        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)?,
        ));
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT)?));
        client_config.transport_config(Arc::new(transport));
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint.connect(server_addr, &self.host)?;
        let conn = tokio::time::timeout(QUIC_HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| Error::UpstreamFailure("QUIC handshake timeout".into()))??;
        debug!(addr = %server_addr, "TUIC QUIC connection established");

        // authenticate on a fresh unidirectional stream right away
        let auth_conn = conn.clone();
        let password_hex = self.password_hex.clone();
        tokio::spawn(async move {
            if let Err(e) = send_authentication(&auth_conn, &password_hex).await {
                info!(error = %e, "fail to send the TUIC authentication command");
                auth_conn.close(
                    VarInt::from_u32(ERR_CODE_AUTH_SEND),
                    b"fail to send authentication command",
                );
            }
        });

        let relaying_tasks = Arc::new(AtomicU64::new(0));
        tokio::spawn(send_heartbeats(conn.clone(), relaying_tasks.clone()));

        Ok(ActiveConn {
            conn,
            relaying_tasks,
            _endpoint: endpoint,
        })
    }
}

/// VER ‖ CMD(0) ‖ UUID(16) ‖ TOKEN(32)，随后关闭 uni 流
async fn send_authentication(conn: &quinn::Connection, password_hex: &str) -> Result<()> {
    let token = auth_token(conn, password_hex)?;
    let mut send = conn.open_uni().await?;
    let mut buf = BytesMut::with_capacity(2 + AUTH_UUID.len() + AUTH_TOKEN_SIZE);
    buf.put_u8(TUIC_VERSION);
    buf.put_u8(CMD_AUTHENTICATE);
    buf.put_slice(AUTH_UUID);
    buf.put_slice(&token);
    send.write_all(&buf).await?;
    let _ = send.finish();
    Ok(())
}

/// 仅在有转发任务时按周期发送 `{VER, CMD=4}` 心跳数据报
async fn send_heartbeats(conn: quinn::Connection, relaying_tasks: Arc<AtomicU64>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if conn.close_reason().is_some() {
            return;
        }
        if relaying_tasks.load(Ordering::Relaxed) != 0 {
            let heartbeat = Bytes::from_static(&[TUIC_VERSION, CMD_HEARTBEAT]);
            if let Err(e) = conn.send_datagram(heartbeat) {
                info!(error = %e, "fail to send a datagram");
                conn.close(
                    VarInt::from_u32(ERR_CODE_HEARTBEAT_SEND),
                    b"fail to send a heartbeat",
                );
                return;
            }
        }
    }
}

/// QUIC 双向流包装。
///
/// 客户端侧在首次写入时融合 connect 命令；关闭时先放弃未写出的头部
/// （等价于给阻塞中的写入者设零写期限），再取消读方向、结束写方向，
/// 避免写阻塞的一端把整条连接拖死。
pub struct TuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    conn: Option<quinn::Connection>,
    header: Option<BytesMut>,
    write_buf: BytesMut,
    relaying_tasks: Option<Arc<AtomicU64>>,
}

impl TuicStream {
    pub fn new_client(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        connect_command: BytesMut,
        conn: quinn::Connection,
        relaying_tasks: Arc<AtomicU64>,
    ) -> Self {
        Self {
            send,
            recv,
            conn: Some(conn),
            header: Some(connect_command),
            write_buf: BytesMut::new(),
            relaying_tasks: Some(relaying_tasks),
        }
    }

    pub fn new_server(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send,
            recv,
            conn: None,
            header: None,
            write_buf: BytesMut::new(),
            relaying_tasks: None,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = match ready!(Pin::new(&mut self.send).poll_write(cx, &self.write_buf)) {
                Ok(n) => n,
                Err(e) => {
                    if let Some(conn) = &self.conn {
                        conn.close(
                            VarInt::from_u32(ERR_CODE_CONNECT_SEND),
                            b"fail to send connect command",
                        );
                    }
                    return Poll::Ready(Err(e.into()));
                }
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TuicStream {
    fn drop(&mut self) {
        let _ = self.recv.stop(VarInt::from_u32(0));
        if let Some(relaying_tasks) = &self.relaying_tasks {
            relaying_tasks.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl AsyncRead for TuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for TuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;

        if let Some(header) = this.header.take() {
            this.write_buf = header;
            this.write_buf.put_slice(buf);
            if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
                return Poll::Ready(Err(e));
            }
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut this.send).poll_write(cx, buf).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        // abandon an unflushed connect command instead of blocking the close
        this.header = None;
        this.write_buf.clear();
        let _ = this.recv.stop(VarInt::from_u32(0));
        Pin::new(&mut this.send).poll_shutdown(cx)
    }
}
