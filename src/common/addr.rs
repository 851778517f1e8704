use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::error::Error;

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// ATYP 字节映射表。SOCKS5、Trojan 与 TUIC 的地址编码只差这三个常量，
/// 因此共用一个编解码器，按协议换表。
#[derive(Debug, Clone, Copy)]
pub struct AddrTypes {
    pub ipv4: u8,
    pub ipv6: u8,
    pub domain: u8,
}

/// SOCKS5 / Trojan 风格: IPv4=0x01, Domain=0x03, IPv6=0x04
pub const SOCKS_ADDR_TYPES: AddrTypes = AddrTypes {
    ipv4: 0x01,
    ipv6: 0x04,
    domain: 0x03,
};

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 二进制编码后的长度: ATYP + ADDR + PORT
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// 编码为 SOCKS5 风格地址
    ///
    /// ```text
    /// +------+-------------------+--------+
    /// | ATYP | ADDR (variable)   |  PORT  |
    /// +------+-------------------+--------+
    /// |  1B  | IP4:4  IP6:16     |  u16be |
    /// |      | Dom: 1B len + str |        |
    /// +------+-------------------+--------+
    /// ```
    pub fn encode(&self, buf: &mut BytesMut, types: AddrTypes) {
        match self {
            Address::Ip(SocketAddr::V4(v4)) => {
                buf.put_u8(types.ipv4);
                buf.put_slice(&v4.ip().octets());
            }
            Address::Ip(SocketAddr::V6(v6)) => {
                buf.put_u8(types.ipv6);
                buf.put_slice(&v6.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(types.domain);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
    }

    /// 从流中解码一个 SOCKS5 风格地址，按 `types` 解释 ATYP 字节
    pub async fn read_from<R>(r: &mut R, types: AddrTypes) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        if atyp == types.ipv4 {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            let port = r.read_u16().await?;
            Ok(Address::Ip(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        } else if atyp == types.ipv6 {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            let port = r.read_u16().await?;
            Ok(Address::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        } else if atyp == types.domain {
            let len = r.read_u8().await? as usize;
            if len == 0 {
                return Err(Error::BadAddress("empty domain".into()).into());
            }
            let mut domain = vec![0u8; len];
            r.read_exact(&mut domain).await?;
            let port = r.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::BadAddress("domain is not valid UTF-8".into()))?;
            Ok(Address::Domain(domain, port))
        } else {
            Err(Error::BadAddress(format!("unknown address type 0x{:02x}", atyp)).into())
        }
    }

    /// 解析文本形式的主机地址。
    ///
    /// 支持的形式:
    /// `127.0.0.1` / `127.0.0.1:80` / `[::1]` / `[::1]:80` /
    /// `example.com` / `example.com:80`
    ///
    /// `require_port` 为真时没有端口的形式被拒绝（HTTP CONNECT 必须带端口）。
    pub fn parse_host_port(host: &str, require_port: bool, default_port: u16) -> Result<Self> {
        if host.is_empty() || host.starts_with(':') {
            return Err(Error::BadAddress("empty host".into()).into());
        }

        if !require_port {
            // IPv4/domain with no port
            if !host.contains(':') {
                return Self::from_host(host, default_port, false);
            }
            // bracketed IPv6 with no port
            if let Some(inner) = host.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                return Self::from_host(inner, default_port, true);
            }
        }

        let (host_part, port_str) = if let Some(rest) = host.strip_prefix('[') {
            // [v6]:port
            let (inner, rest) = rest
                .split_once(']')
                .ok_or_else(|| Error::BadAddress(format!("malformed brackets in '{}'", host)))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| Error::BadAddress(format!("missing port in '{}'", host)))?;
            (inner, port)
        } else {
            let (h, p) = host
                .rsplit_once(':')
                .ok_or_else(|| Error::BadAddress(format!("missing port in '{}'", host)))?;
            if h.contains(':') {
                // a bare IPv6 with a port is ambiguous without brackets
                return Err(
                    Error::BadAddress(format!("unbracketed IPv6 in '{}'", host)).into(),
                );
            }
            (h, p)
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::BadAddress(format!("invalid port '{}'", port_str)))?;
        Self::from_host(host_part, port, host.starts_with('['))
    }

    fn from_host(host: &str, port: u16, ipv6_required: bool) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::BadAddress("empty host".into()).into());
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                if ipv6_required && !ip.is_ipv6() {
                    return Err(
                        Error::BadAddress(format!("require IPv6 address but found {}", host))
                            .into(),
                    );
                }
                Ok(Address::Ip(SocketAddr::new(ip, port)))
            }
            Err(_) => {
                if ipv6_required {
                    return Err(
                        Error::BadAddress(format!("require IPv6 address but found {}", host))
                            .into(),
                    );
                }
                if host.len() > 255 {
                    return Err(Error::BadAddress("domain longer than 255 bytes".into()).into());
                }
                Ok(Address::Domain(host.to_string(), port))
            }
        }
    }
}

impl fmt::Display for Address {
    /// `host:port`，IPv6 使用方括号形式
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
