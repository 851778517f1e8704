use anyhow::Result;
use base64::Engine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::common::error::Error;
use crate::common::{Address, PrefixedStream, ProxyStream};
use crate::router::Router;

const MAX_LINE_SIZE: usize = 8192;
const MAX_HEADER_COUNT: usize = 128;

/// 双向都要剥除的逐跳首部（加上 `Connection` 首部点名的那些）
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    line: String,
    headers: Vec<(String, String)>,
}

enum BodyKind {
    None,
    Length(u64),
    Chunked,
    /// 无长度信息的响应体: 读到对端关闭为止
    UntilClose,
}

/// HTTP 入站: CONNECT 隧道或单目标正向代理
pub async fn handle<S>(stream: S, auth: &Option<(String, String)>, router: &Router) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(stream);
    let head = match read_request_head(&mut reader).await? {
        Some(head) => head,
        None => return Ok(()),
    };

    let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
    let dest = if is_connect {
        // https://datatracker.ietf.org/doc/html/rfc9110#name-connect
        // clients MUST send the port number; reject elided ports
        Address::parse_host_port(&head.target, true, 0)
    } else {
        target_of_plain_request(&head)
    };
    let dest = match dest {
        Ok(dest) => dest,
        Err(e) => {
            write_error_response(reader.get_mut(), &head.version, 400).await?;
            return Err(e);
        }
    };

    if let Some((username, password)) = auth {
        if !verify_proxy_auth(&head.headers, username, password) {
            write_error_response(reader.get_mut(), &head.version, 407).await?;
            return Err(Error::AuthFailure(
                "no authentication info, or incorrect username/password".into(),
            )
            .into());
        }
    }

    if is_connect {
        debug!(target = %dest, "HTTP CONNECT request");
        let stream = reader.get_mut();
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

        // body bytes already buffered past the request head belong to the tunnel
        let preload = reader.buffer().to_vec();
        let inner = reader.into_inner();
        let stream: ProxyStream = Box::new(PrefixedStream::new(preload, Box::new(inner)));
        crate::proxy::forward_tcp(router, &dest, stream).await
    } else {
        debug!(target = %dest, method = %head.method, "HTTP proxy request");
        serve_plain_http(reader, head, dest, router).await
    }
}

/// 非 CONNECT 正向代理: 对第一个请求确定的目标转发后续请求/响应，
/// 双向剥除逐跳首部，直到一侧要求关闭或客户端 EOF
async fn serve_plain_http<S>(
    mut client: BufReader<S>,
    first_head: RequestHead,
    dest: Address,
    router: &Router,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let outbound = router.dial(&dest).await?;
    let mut origin = BufReader::new(outbound);
    let mut head = first_head;

    loop {
        let is_head_request = head.method.eq_ignore_ascii_case("HEAD");
        let request_close = wants_close(&head.headers);
        let request_body = body_kind(&head.headers, true)?;

        let mut to_send = head;
        to_send.target = origin_form_target(&to_send.target);
        strip_hop_by_hop(&mut to_send.headers);
        if matches!(request_body, BodyKind::Chunked) {
            to_send
                .headers
                .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        }
        write_request_head(origin.get_mut(), &to_send).await?;
        copy_body(&mut client, origin.get_mut(), &request_body).await?;
        origin.get_mut().flush().await?;

        let mut response = read_response_head(&mut origin).await?;
        let response_close = wants_close(&response.headers);
        let response_body = if is_head_request || no_body_status(response.status) {
            BodyKind::None
        } else {
            body_kind(&response.headers, false)?
        };
        strip_hop_by_hop(&mut response.headers);
        if matches!(response_body, BodyKind::Chunked) {
            // chunked framing is ours to re-apply after stripping
            response
                .headers
                .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        }
        if matches!(response_body, BodyKind::UntilClose) {
            response
                .headers
                .push(("Connection".to_string(), "close".to_string()));
        }
        write_response_head(client.get_mut(), &response).await?;
        copy_body(&mut origin, client.get_mut(), &response_body).await?;
        client.get_mut().flush().await?;

        if matches!(response_body, BodyKind::UntilClose) || request_close || response_close {
            return Ok(());
        }
        head = match read_request_head(&mut client).await? {
            Some(next) => next,
            None => return Ok(()),
        };
    }
}

async fn read_line_limited<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") {
        return Err(Error::ProtocolViolation("header line too long".into()).into());
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn read_headers<R>(reader: &mut R) -> Result<Vec<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = read_line_limited(reader)
            .await?
            .ok_or_else(|| Error::ProtocolViolation("unexpected EOF in headers".into()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(Error::ProtocolViolation("too many headers".into()).into());
        }
        let line = String::from_utf8(line)
            .map_err(|_| Error::ProtocolViolation("header is not valid UTF-8".into()))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::ProtocolViolation(format!("malformed header '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let line = match read_line_limited(reader).await? {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(None),
    };
    let line = String::from_utf8(line)
        .map_err(|_| Error::ProtocolViolation("request line is not valid UTF-8".into()))?;
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(
                Error::ProtocolViolation(format!("invalid request line '{}'", line)).into(),
            )
        }
    };
    let headers = read_headers(reader).await?;
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line_limited(reader)
        .await?
        .ok_or_else(|| Error::UpstreamFailure("origin closed before responding".into()))?;
    let line = String::from_utf8(line)
        .map_err(|_| Error::ProtocolViolation("status line is not valid UTF-8".into()))?;
    let mut parts = line.splitn(3, ' ');
    let _version = parts
        .next()
        .ok_or_else(|| Error::ProtocolViolation("empty status line".into()))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::ProtocolViolation(format!("invalid status line '{}'", line)))?;
    let headers = read_headers(reader).await?;
    Ok(ResponseHead {
        status,
        line,
        headers,
    })
}

async fn write_request_head<W>(writer: &mut W, head: &RequestHead) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version);
    for (name, value) in &head.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}

async fn write_response_head<W>(writer: &mut W, head: &ResponseHead) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = String::with_capacity(128);
    out.push_str(&head.line);
    out.push_str("\r\n");
    for (name, value) in &head.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}

/// 错误响应只有状态行，版本与请求一致，响应体为空
async fn write_error_response<W>(writer: &mut W, version: &str, status: u16) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = match status {
        400 => "Bad Request",
        407 => "Proxy Authentication Required",
        _ => "Internal Server Error",
    };
    let response = format!("{} {} {}\r\n\r\n", version, status, reason);
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn verify_proxy_auth(headers: &[(String, String)], username: &str, password: &str) -> bool {
    let value = match header_value(headers, "Proxy-Authorization") {
        Some(value) => value,
        None => return false,
    };
    let encoded = match value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
    {
        Some(encoded) => encoded.trim(),
        None => return false,
    };
    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    let credential = match String::from_utf8(decoded) {
        Ok(credential) => credential,
        Err(_) => return false,
    };
    match credential.split_once(':') {
        Some((u, p)) => u == username && p == password,
        None => false,
    }
}

/// see https://www.mnot.net/blog/2011/07/11/what_proxies_must_do point 1
fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    let mut to_remove: Vec<String> = HOP_BY_HOP_HEADERS.iter().map(|s| s.to_string()).collect();
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Connection") {
            for listed in value.split(',') {
                to_remove.push(listed.trim().to_ascii_lowercase());
            }
        }
    }
    headers.retain(|(name, _)| !to_remove.contains(&name.to_ascii_lowercase()));
}

fn wants_close(headers: &[(String, String)]) -> bool {
    header_value(headers, "Connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false)
}

fn body_kind(headers: &[(String, String)], is_request: bool) -> Result<BodyKind> {
    if let Some(te) = header_value(headers, "Transfer-Encoding") {
        if te
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyKind::Chunked);
        }
        return Err(Error::ProtocolViolation(format!(
            "unsupported transfer encoding '{}'",
            te
        ))
        .into());
    }
    if let Some(cl) = header_value(headers, "Content-Length") {
        let length: u64 = cl
            .trim()
            .parse()
            .map_err(|_| Error::ProtocolViolation(format!("invalid content length '{}'", cl)))?;
        return Ok(BodyKind::Length(length));
    }
    if is_request {
        Ok(BodyKind::None)
    } else {
        Ok(BodyKind::UntilClose)
    }
}

fn no_body_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// 绝对 URL → (目标地址, origin-form 路径)；相对路径回退到 Host 首部
fn target_of_plain_request(head: &RequestHead) -> Result<Address> {
    if head.target.starts_with('/') {
        let host = header_value(&head.headers, "Host").ok_or_else(|| {
            Error::BadAddress("relative request target without a Host header".into())
        })?;
        return Address::parse_host_port(host, false, 80);
    }
    let without_scheme = head
        .target
        .strip_prefix("http://")
        .or_else(|| head.target.strip_prefix("HTTP://"))
        .ok_or_else(|| {
            Error::BadAddress(format!(
                "only http:// URLs are supported, got '{}'",
                head.target
            ))
        })?;
    let host_port = match without_scheme.find('/') {
        Some(pos) => &without_scheme[..pos],
        None => without_scheme,
    };
    Address::parse_host_port(host_port, false, 80)
}

fn origin_form_target(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    let without_scheme = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("HTTP://"))
        .unwrap_or(target);
    match without_scheme.find('/') {
        Some(pos) => without_scheme[pos..].to_string(),
        None => "/".to_string(),
    }
}

async fn copy_body<R, W>(reader: &mut R, writer: &mut W, kind: &BodyKind) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match kind {
        BodyKind::None => Ok(()),
        BodyKind::Length(length) => {
            let mut remaining = *length;
            let mut buf = [0u8; 4096];
            while remaining > 0 {
                let want = (buf.len() as u64).min(remaining) as usize;
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(Error::ProtocolViolation(
                        "body ended before the declared content length".into(),
                    )
                    .into());
                }
                writer.write_all(&buf[..n]).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
        BodyKind::Chunked => copy_chunked(reader, writer).await,
        BodyKind::UntilClose => {
            tokio::io::copy(reader, writer).await?;
            Ok(())
        }
    }
}

/// 按 chunk 边界逐段透传，直到零长 chunk 与 trailer 结束
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_line_limited(reader)
            .await?
            .ok_or_else(|| Error::ProtocolViolation("unexpected EOF in chunked body".into()))?;
        let size_part = line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(&line[..]);
        let size_str = std::str::from_utf8(size_part)
            .map_err(|_| Error::ProtocolViolation("invalid chunk size".into()))?;
        let size = u64::from_str_radix(size_str.trim(), 16)
            .map_err(|_| Error::ProtocolViolation(format!("invalid chunk size '{}'", size_str)))?;

        writer.write_all(&line).await?;
        writer.write_all(b"\r\n").await?;

        if size == 0 {
            // pass trailers through until the final empty line
            loop {
                let trailer = read_line_limited(reader).await?.ok_or_else(|| {
                    Error::ProtocolViolation("unexpected EOF in chunked trailers".into())
                })?;
                writer.write_all(&trailer).await?;
                writer.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }

        let mut remaining = size;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(
                    Error::ProtocolViolation("unexpected EOF in chunk data".into()).into(),
                );
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        writer.write_all(&crlf).await?;
    }
}
