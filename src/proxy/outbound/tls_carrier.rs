use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{net, tls, Address, ProxyStream, SOCKS_ADDR_TYPES};
use crate::config::ProxyNode;

pub const CMD_CONNECT: u8 = 0x01;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const ESCAPED_LF: u8 = LF + 1;

/// 16 字节原始密码中的 `\r\n` 换成 `\r\x0B`，保证服务端按行读首包时
/// 密码内不会出现行终止符。对不再含 CRLF 的输入是幂等的，且不会引入
/// 新的 CRLF。客户端启动时做一次，服务端计算比较值时做一次。
pub fn escape_crlf(password_raw: [u8; 16]) -> [u8; 16] {
    let mut escaped = password_raw;
    let mut after_cr = false;
    for b in escaped.iter_mut() {
        if after_cr && *b == LF {
            *b = ESCAPED_LF;
        }
        after_cr = *b == CR;
    }
    escaped
}

/// Trojan 兼容的服务端标识: hex(SHA-224(密码的 32 位十六进制字符串))
pub fn trojan_password(password_hex: &str) -> [u8; 56] {
    let mut hasher = Sha224::new();
    hasher.update(password_hex.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 56];
    for (i, b) in digest.iter().enumerate() {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        out[i * 2] = HEX[(b >> 4) as usize];
        out[i * 2 + 1] = HEX[(b & 0x0f) as usize];
    }
    out
}

/*
首包（建立 TLS 会话后）:
+-----------------------+---------+-----+------+----------+----------+----------+
|  escaped password     |  CRLF   | CMD | ATYP | DST.ADDR | DST.PORT | Payload  |
+-----------------------+---------+-----+------+----------+----------+----------+
|          16           | X'0D0A' |  1  |  1   | Variable |    2     | Variable |
+-----------------------+---------+-----+------+----------+----------+----------+
与 Trojan 不同，地址之后没有第二个 CRLF。
*/
pub fn encode_request_header(password_escaped: &[u8; 16], dest: &Address) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + 2 + 1 + dest.encoded_len());
    buf.put_slice(password_escaped);
    buf.put_slice(b"\r\n");
    buf.put_u8(CMD_CONNECT);
    dest.encode(&mut buf, SOCKS_ADDR_TYPES);
    buf
}

/// Trojan 式 TLS 载体客户端
pub struct TlsCarrierClient {
    host: String,
    tls_port: u16,
    password_escaped: [u8; 16],
    connector: TlsConnector,
}

impl TlsCarrierClient {
    pub fn new(node: &ProxyNode, tls_key_log: bool) -> Result<Self> {
        let config = tls::client_config(&node.host, node.tls_cert.as_deref(), tls_key_log)?;
        Ok(Self {
            host: node.host.clone(),
            tls_port: node.tls_port,
            password_escaped: escape_crlf(node.password.raw),
            connector: TlsConnector::from(config),
        })
    }

    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        let host_port = format!("{}:{}", self.host, self.tls_port);
        let tcp = net::dial_tcp_host(&host_port).await?;
        let server_name = tls::server_name(&self.host)?;
        let stream = self.connector.connect(server_name, tcp).await?;
        debug!(target = %addr, server = %host_port, "TLS carrier connect");
        let header = encode_request_header(&self.password_escaped, addr);
        Ok(Box::new(FusedHeaderStream::new(stream, header)))
    }
}

/// 在首次写入时把协议头与首包载荷融合为一次写出的流包装。
/// 头部发出后读写直通底层流。
pub struct FusedHeaderStream<S> {
    inner: S,
    header: Option<BytesMut>,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> FusedHeaderStream<S> {
    pub fn new(inner: S, header: BytesMut) -> Self {
        Self {
            inner,
            header: Some(header),
            write_buf: BytesMut::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncRead for FusedHeaderStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncWrite for FusedHeaderStream<S> {
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
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(header) = this.header.take() {
            // the header alone still identifies the destination to the server
            this.write_buf = header;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
