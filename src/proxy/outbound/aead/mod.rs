pub mod crypto;

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::error::Error;
use crate::common::{net, Address, ProxyStream, SOCKS_ADDR_TYPES};
use crate::config::ProxyNode;
use crypto::{
    apply_exemption_prefix, generate_salt, validate_unix_time, AeadState, LEN_FIELD_SIZE,
    MAX_CHUNK_SIZE, MAX_PADDING_SIZE, RESP_FIXED_HEADER_SIZE, SALT_SIZE,
    SERVER_STREAM_HEADER_TYPE, TAG_SIZE,
};

/*
Shadowsocks-2022 兼容的 AEAD 载体，客户端方向。

请求流:
+--------+------------------------+---------------------------+------------------------+---------------------------+---+
|  salt  | encrypted header chunk |  encrypted header chunk   | encrypted length chunk |  encrypted payload chunk  |...|
+--------+------------------------+---------------------------+------------------------+---------------------------+---+
|  16B   |   11B + 16B AEAD tag   | variable length + 16B tag |  2B length + 16B tag   | variable length + 16B tag |...|
+--------+------------------------+---------------------------+------------------------+---------------------------+---+
*/

/// AEAD 载体客户端
pub struct AeadClient {
    host: String,
    tcp_port: u16,
    psk: [u8; 16],
}

impl AeadClient {
    pub fn new(node: &ProxyNode) -> Result<Self> {
        let tcp_port = node
            .tcp_port
            .ok_or_else(|| Error::BadConfig("AEAD carrier outbound missing 'tcp-port'".into()))?;
        Ok(Self {
            host: node.host.clone(),
            tcp_port,
            psk: node.password.raw,
        })
    }

    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        let host_port = format!("{}:{}", self.host, self.tcp_port);
        let stream = net::dial_tcp_host(&host_port).await?;
        let mut salt = generate_salt();
        apply_exemption_prefix(&mut salt);
        debug!(target = %addr, server = %host_port, "AEAD carrier connect");
        Ok(Box::new(AeadClientStream::new(
            stream,
            addr.clone(),
            self.psk,
            salt,
        )))
    }
}

enum ReadState {
    FirstResponse,
    Length,
    Payload(usize),
}

/// 客户端侧的 AEAD 帧流。
///
/// 写方向: 首次写入融合 salt、两个加密头块与首包载荷；
/// 之后按 ≤65535 字节分块，每块为 length chunk + payload chunk。
/// 读方向: 先读服务端首响应头（含本端 salt 回显校验），再流式解块。
pub struct AeadClientStream<S> {
    inner: S,
    dest: Address,
    psk: [u8; 16],
    client_salt: [u8; SALT_SIZE],
    writer: AeadState,
    reader: Option<AeadState>,
    header_written: bool,
    write_buf: BytesMut,
    read_state: ReadState,
    read_buf: BytesMut,
    decrypted: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AeadClientStream<S> {
    pub fn new(inner: S, dest: Address, psk: [u8; 16], client_salt: [u8; SALT_SIZE]) -> Self {
        let writer = AeadState::from_salt(&psk, &client_salt);
        Self {
            inner,
            dest,
            psk,
            client_salt,
            writer,
            reader: None,
            header_written: false,
            write_buf: BytesMut::new(),
            read_state: ReadState::FirstResponse,
            read_buf: BytesMut::new(),
            decrypted: BytesMut::new(),
        }
    }

    /// salt ‖ SEAL(type ‖ unix_time ‖ var_len) ‖ SEAL(addr ‖ padding_len ‖ padding|payload)
    fn encode_first_packet(&mut self, payload: &[u8]) -> io::Result<usize> {
        let addr_len = self.dest.encoded_len();
        let take = payload.len().min(MAX_CHUNK_SIZE - addr_len - LEN_FIELD_SIZE);
        // padding is only emitted when there is no initial payload
        let padding_len = if take == 0 {
            rand::thread_rng().gen_range(1..=MAX_PADDING_SIZE)
        } else {
            0
        };
        let var_len = addr_len + LEN_FIELD_SIZE + take + padding_len;

        let mut fixed = BytesMut::with_capacity(crypto::REQ_FIXED_HEADER_SIZE);
        fixed.put_u8(crypto::CLIENT_STREAM_HEADER_TYPE);
        fixed.put_u64(crypto::unix_time_now());
        fixed.put_u16(var_len as u16);

        let mut var = BytesMut::with_capacity(var_len);
        self.dest.encode(&mut var, SOCKS_ADDR_TYPES);
        var.put_u16(padding_len as u16);
        if take > 0 {
            var.put_slice(&payload[..take]);
        } else {
            let mut padding = vec![0u8; padding_len];
            rand::thread_rng().fill(padding.as_mut_slice());
            var.put_slice(&padding);
        }

        self.write_buf.put_slice(&self.client_salt);
        let sealed_fixed = self.writer.seal(&fixed).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_fixed);
        let sealed_var = self.writer.seal(&var).map_err(io_err)?;
        self.write_buf.put_slice(&sealed_var);
        Ok(take)
    }

    fn encode_chunk(&mut self, payload: &[u8]) -> io::Result<usize> {
        let take = payload.len().min(MAX_CHUNK_SIZE);
        let sealed_len = self
            .writer
            .seal(&(take as u16).to_be_bytes())
            .map_err(io_err)?;
        self.write_buf.put_slice(&sealed_len);
        let sealed_payload = self.writer.seal(&payload[..take]).map_err(io_err)?;
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

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncRead for AeadClientStream<S> {
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
                ReadState::FirstResponse => {
                    let target = SALT_SIZE + RESP_FIXED_HEADER_SIZE + TAG_SIZE;
                    if !ready!(poll_read_exact_into(
                        &mut this.inner,
                        cx,
                        &mut this.read_buf,
                        target
                    ))? {
                        return Poll::Ready(Ok(()));
                    }
                    let mut server_salt = [0u8; SALT_SIZE];
                    server_salt.copy_from_slice(&this.read_buf[..SALT_SIZE]);
                    let mut reader = AeadState::from_salt(&this.psk, &server_salt);
                    let fixed = reader
                        .open(&this.read_buf[SALT_SIZE..target])
                        .map_err(io_err)?;
                    if fixed[0] != SERVER_STREAM_HEADER_TYPE {
                        return Poll::Ready(Err(invalid_data(format!(
                            "invalid stream header type '{}'",
                            fixed[0]
                        ))));
                    }
                    validate_unix_time(&fixed[1..9]).map_err(io_err)?;
                    if fixed[9..9 + SALT_SIZE] != this.client_salt {
                        return Poll::Ready(Err(invalid_data(
                            "incorrect client salt in response header".into(),
                        )));
                    }
                    let len =
                        u16::from_be_bytes([fixed[9 + SALT_SIZE], fixed[10 + SALT_SIZE]]) as usize;
                    this.reader = Some(reader);
                    this.read_buf.clear();
                    this.read_state = ReadState::Payload(len);
                }
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
                    let reader = this.reader.as_mut().expect("reader set after first response");
                    let len_bytes = reader.open(&this.read_buf[..target]).map_err(io_err)?;
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
                        // EOF between a length chunk and its payload chunk
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let reader = this.reader.as_mut().expect("reader set after first response");
                    let payload = reader.open(&this.read_buf[..target]).map_err(io_err)?;
                    this.decrypted.put_slice(&payload);
                    this.read_buf.clear();
                    this.read_state = ReadState::Length;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncWrite for AeadClientStream<S> {
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
            // nothing ever flowed: still emit a valid padded request header
            this.header_written = true;
            this.encode_first_packet(&[])?;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// 读满 `target` 字节到 `buf`。
/// 返回 Ok(false) 表示在帧边界上干净地读到 EOF（buf 为空时）。
pub(crate) fn poll_read_exact_into<S: AsyncRead + Unpin>(
    inner: &mut S,
    cx: &mut Context<'_>,
    buf: &mut BytesMut,
    target: usize,
) -> Poll<io::Result<bool>> {
    while buf.len() < target {
        let mut tmp = [0u8; 4096];
        let want = (target - buf.len()).min(tmp.len());
        let mut read_buf = ReadBuf::new(&mut tmp[..want]);
        ready!(Pin::new(&mut *inner).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        if n == 0 {
            if buf.is_empty() {
                return Poll::Ready(Ok(false));
            }
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.extend_from_slice(read_buf.filled());
    }
    Poll::Ready(Ok(true))
}

fn io_err(e: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
