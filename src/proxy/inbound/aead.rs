use std::collections::HashMap;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::error::Error;
use crate::common::{net, Address, PrefixedStream, ProxyStream, SOCKS_ADDR_TYPES};
use crate::config::HgConfig;
use crate::proxy::outbound::aead::crypto::{
    generate_salt, unix_time_now, validate_unix_time, AeadState, CLIENT_STREAM_HEADER_TYPE,
    LEN_FIELD_SIZE, MAX_CHUNK_SIZE, REQ_FIXED_HEADER_SIZE, SALT_SIZE,
    SERVER_STREAM_HEADER_TYPE, TAG_SIZE,
};
use crate::proxy::outbound::aead::poll_read_exact_into;
use crate::router::Router;

/// Servers MUST store all incoming salts for 60 seconds and reject repeats.
pub const SALT_RETAIN_DURATION: Duration = Duration::from_secs(60);

/// 服务端 salt 重放池。
///
/// check 与 insert 合并为单次加锁的 `try_insert`，消除两个相同 salt 的
/// 连接先后通过 check 的竞争窗口；握手失败烧掉的 salt 在保留期内同样
/// 不可复用。超过保留期的条目在下一次到期检查时惰性清除。
pub struct SaltPool {
    inner: Mutex<SaltPoolInner>,
}

struct SaltPoolInner {
    pool: HashMap<[u8; SALT_SIZE], Instant>,
    last_sweep: Instant,
}

impl SaltPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SaltPoolInner {
                pool: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn try_insert(&self, salt: [u8; SALT_SIZE]) -> bool {
        self.try_insert_at(salt, Instant::now())
    }

    fn try_insert_at(&self, salt: [u8; SALT_SIZE], now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if now.duration_since(inner.last_sweep) > SALT_RETAIN_DURATION {
            inner
                .pool
                .retain(|_, added| now.duration_since(*added) <= SALT_RETAIN_DURATION);
            inner.last_sweep = now;
        }
        if inner.pool.contains_key(&salt) {
            return false;
        }
        inner.pool.insert(salt, now);
        true
    }
}

/// AEAD 载体服务端: 认证并提取目标地址后经路由转发。
pub async fn serve(
    hg: &HgConfig,
    router: Arc<Router>,
    token: CancellationToken,
) -> Result<()> {
    let tcp_port = hg
        .tcp_port
        .ok_or_else(|| Error::BadConfig("AEAD carrier server needs 'tcp-port'".into()))?;
    let psk = hg.password.raw;
    let pool = Arc::new(SaltPool::new());

    let listen = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), tcp_port);
    net::serve_tcp(token, listen, "AEAD carrier", move |conn, _peer| {
        let router = router.clone();
        let pool = pool.clone();
        async move { handle_connection(conn, psk, &pool, &router).await }
    })
    .await
}

async fn handle_connection(
    mut conn: TcpStream,
    psk: [u8; 16],
    pool: &SaltPool,
    router: &Router,
) -> Result<()> {
    let (dest, initial_payload, reader, client_salt) =
        match handshake(&mut conn, psk, pool).await {
            Ok(parts) => parts,
            Err(e) => {
                // close with RST rather than FIN so an active prober cannot
                // distinguish this server from a closed port
                let _ = conn.set_linger(Some(Duration::ZERO));
                return Err(e);
            }
        };

    debug!(target = %dest, "AEAD carrier request accepted");
    let stream = AeadServerStream::new(conn, psk, client_salt, reader);
    let stream: ProxyStream = if initial_payload.is_empty() {
        Box::new(stream)
    } else {
        Box::new(PrefixedStream::new(initial_payload, Box::new(stream)))
    };
    crate::proxy::forward_tcp(router, &dest, stream).await
}

/// 读取并校验客户端首帧: salt 查重、固定头解密、时间窗、变长头解析。
/// 返回目标地址、首包载荷与已推进到流式块的解密状态。
pub(crate) async fn handshake<S>(
    conn: &mut S,
    psk: [u8; 16],
    pool: &SaltPool,
) -> Result<(Address, Vec<u8>, AeadState, [u8; SALT_SIZE])>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; SALT_SIZE + REQ_FIXED_HEADER_SIZE + TAG_SIZE];
    conn.read_exact(&mut head).await?;

    let mut client_salt = [0u8; SALT_SIZE];
    client_salt.copy_from_slice(&head[..SALT_SIZE]);
    if !pool.try_insert(client_salt) {
        return Err(Error::Replay.into());
    }

    let mut reader = AeadState::from_salt(&psk, &client_salt);
    let fixed = reader.open(&head[SALT_SIZE..])?;
    if fixed[0] != CLIENT_STREAM_HEADER_TYPE {
        return Err(Error::ProtocolViolation(format!(
            "invalid stream header type '{}', '{}' expected",
            fixed[0], CLIENT_STREAM_HEADER_TYPE
        ))
        .into());
    }
    validate_unix_time(&fixed[1..9])?;
    let var_len = u16::from_be_bytes([fixed[9], fixed[10]]) as usize;

    let mut var = vec![0u8; var_len + TAG_SIZE];
    conn.read_exact(&mut var).await?;
    let var = reader.open(&var)?;

    let mut cursor = io::Cursor::new(&var[..]);
    let dest = Address::read_from(&mut cursor, SOCKS_ADDR_TYPES).await?;
    let remaining = var.len() - cursor.position() as usize;
    if remaining <= LEN_FIELD_SIZE {
        return Err(Error::ProtocolViolation(
            "client payload and the padding length are both 0 in request variable-length header"
                .into(),
        )
        .into());
    }
    let rest = &var[cursor.position() as usize..];
    let padding_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[LEN_FIELD_SIZE..];
    if rest.len() < padding_len {
        return Err(Error::ProtocolViolation(format!(
            "expect {} padding byte(s), but only have {} remain bytes in request header",
            padding_len,
            rest.len()
        ))
        .into());
    }
    let initial_payload = rest[padding_len..].to_vec();
    Ok((dest, initial_payload, reader, client_salt))
}

enum ReadState {
    Length,
    Payload(usize),
}

/// 服务端侧的 AEAD 帧流: 握手之后的流式收发。
///
/// 写方向首帧为响应头（type=1，回显客户端 salt）融合首个载荷块。
pub struct AeadServerStream<S> {
    inner: S,
    psk: [u8; 16],
    client_salt: [u8; SALT_SIZE],
    reader: AeadState,
    writer: Option<AeadState>,
    header_written: bool,
    write_buf: BytesMut,
    read_state: ReadState,
    read_buf: BytesMut,
    decrypted: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AeadServerStream<S> {
    pub fn new(inner: S, psk: [u8; 16], client_salt: [u8; SALT_SIZE], reader: AeadState) -> Self {
        Self {
            inner,
            psk,
            client_salt,
            reader,
            writer: None,
            header_written: false,
            write_buf: BytesMut::new(),
            read_state: ReadState::Length,
            read_buf: BytesMut::new(),
            decrypted: BytesMut::new(),
        }
    }

    /// salt ‖ SEAL(type ‖ unix_time ‖ client_salt ‖ len) ‖ SEAL(payload)
    fn encode_first_packet(&mut self, payload: &[u8]) -> io::Result<usize> {
        let take = payload.len().min(MAX_CHUNK_SIZE);
        let server_salt = generate_salt();
        let mut writer = AeadState::from_salt(&self.psk, &server_salt);

        let mut fixed = BytesMut::with_capacity(1 + 8 + SALT_SIZE + LEN_FIELD_SIZE);
        fixed.put_u8(SERVER_STREAM_HEADER_TYPE);
        fixed.put_u64(unix_time_now());
        fixed.put_slice(&self.client_salt);
        fixed.put_u16(take as u16);

        self.write_buf.put_slice(&server_salt);
        let sealed_fixed = writer.seal(&fixed).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_fixed);
        let sealed_payload = writer.seal(&payload[..take]).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_payload);
        self.writer = Some(writer);
        Ok(take)
    }

    fn encode_chunk(&mut self, payload: &[u8]) -> io::Result<usize> {
        let take = payload.len().min(MAX_CHUNK_SIZE);
        let writer = self.writer.as_mut().expect("writer set by first packet");
        let sealed_len = writer.seal(&(take as u16).to_be_bytes()).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_len);
        let sealed_payload = writer.seal(&payload[..take]).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_payload);
        Ok(take)
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

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncRead for AeadServerStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.decrypted.is_empty() {
                let n = this.decrypted.len().min(buf.remaining());
                buf.put_slice(&this.decrypted[..n]);
                this.decrypted.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.read_state {
                ReadState::Length => {
                    let target = LEN_FIELD_SIZE + TAG_SIZE;
                    if !ready!(poll_read_exact_into(
                        &mut this.inner,
                        cx,
                        &mut this.read_buf,
                        target
                    ))? {
                        return Poll::Ready(Ok(()));
                    }
                    let len_bytes = this.reader.open(&this.read_buf[..target]).map_err(io_err)?;
                    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                    this.read_buf.clear();
                    this.read_state = ReadState::Payload(len);
                }
                ReadState::Payload(len) => {
                    let target = len + TAG_SIZE;
                    if !ready!(poll_read_exact_into(
                        &mut this.inner,
                        cx,
                        &mut this.read_buf,
                        target
                    ))? {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let payload = this.reader.open(&this.read_buf[..target]).map_err(io_err)?;
                    this.decrypted.put_slice(&payload);
                    this.read_buf.clear();
                    this.read_state = ReadState::Length;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncWrite for AeadServerStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;

        let consumed = if !this.header_written {
            this.header_written = true;
            this.encode_first_packet(buf)?
        } else {
            this.encode_chunk(buf)?
        };

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.header_written {
            this.header_written = true;
            this.encode_first_packet(&[])?;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

fn io_err(e: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
