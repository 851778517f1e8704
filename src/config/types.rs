use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_HTTP_SOCKS_PORT: u16 = 1080;
pub const DEFAULT_TLS_PORT: u16 = 443;
pub const DEFAULT_PROFILING_PORT: u16 = 6060;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub inbounds: Inbounds,
    #[serde(default)]
    pub outbounds: HashMap<String, ProxyNode>,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub misc: Misc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inbounds {
    #[serde(rename = "http-socks")]
    pub http_socks: Option<HttpSocksConfig>,
    pub hg: Option<HgConfig>,
}

/// HTTP/SOCKS 混合入站监听配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSocksConfig {
    pub host: String,
    #[serde(default = "default_http_socks_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "system-proxy", default)]
    pub system_proxy: bool,
}

impl HttpSocksConfig {
    /// 未配置用户名和密码时不要求认证
    pub fn auth(&self) -> Option<(String, String)> {
        if self.username.is_empty() && self.password.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }
}

/// 载体协议服务端（入站）配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HgConfig {
    pub host: String,
    pub password: Password,
    #[serde(rename = "tls-port", default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(rename = "tcp-port")]
    pub tcp_port: Option<u16>,
    #[serde(rename = "quic-port")]
    pub quic_port: Option<u16>,
    #[serde(rename = "tls-cert-key-pair")]
    pub tls_cert_key_pair: Option<TlsCertKeyPair>,
    #[serde(rename = "tls-bad-auth-fallback-site-dir")]
    pub tls_bad_auth_fallback_site_dir: Option<PathBuf>,
}

/// 载体协议客户端（出站）节点配置。
/// 端口决定载体: quic-port → TUIC, tcp-port → AEAD/TCP, 否则 TLS
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyNode {
    pub host: String,
    pub password: Password,
    #[serde(rename = "tls-port", default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(rename = "tcp-port")]
    pub tcp_port: Option<u16>,
    #[serde(rename = "quic-port")]
    pub quic_port: Option<u16>,
    #[serde(rename = "tls-cert")]
    pub tls_cert: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(rename = "final", default = "default_final_policy")]
    pub final_policy: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            final_policy: default_final_policy(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(rename = "match")]
    pub match_rules: Vec<String>,
    pub policy: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Misc {
    #[serde(rename = "verbose-log", default)]
    pub verbose_log: bool,
    #[serde(rename = "tls-key-log", default)]
    pub tls_key_log: bool,
    #[serde(rename = "hg-binary-auto-update", default)]
    pub hg_binary_auto_update: bool,
    #[serde(rename = "rules-file-auto-update", default)]
    pub rules_file_auto_update: bool,
    #[serde(default)]
    pub profiling: bool,
    #[serde(rename = "profiling-port", default = "default_profiling_port")]
    pub profiling_port: u16,
}

impl Default for Misc {
    fn default() -> Self {
        Self {
            verbose_log: false,
            tls_key_log: false,
            hg_binary_auto_update: false,
            rules_file_auto_update: false,
            profiling: false,
            profiling_port: DEFAULT_PROFILING_PORT,
        }
    }
}

/// 16 字节原始密码，来自 32 位十六进制字符串。
///
/// 原始形式用作 AEAD 载体的 PSK 与 TLS 载体的客户端标识；
/// 字符串形式经 SHA-224 十六进制后是 Trojan 兼容的服务端标识。
#[derive(Clone)]
pub struct Password {
    pub raw: [u8; 16],
    pub hex: String,
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(****)")
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)
            .map_err(|_| D::Error::custom("fail to parse the 'password' field"))?;
        let raw = decode_hex_16(&hex)
            .ok_or_else(|| D::Error::custom("the password should be 32 hex characters in length"))?;
        Ok(Password { raw, hex })
    }
}

fn decode_hex_16(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    let mut raw = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        raw[i] = ((hi << 4) | lo) as u8;
    }
    Some(raw)
}

/// 证书与私钥路径，配置值为空白分隔的两个路径，
/// 例如 `"tls-cert-key-pair": "tls_cert.pem tls_key.pem"`
#[derive(Debug, Clone)]
pub struct TlsCertKeyPair {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl<'de> Deserialize<'de> for TlsCertKeyPair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(D::Error::custom(
                "the certificate and key file's paths must be separated by whitespace, \
                 e.g. 'tls-cert-key-pair': 'tls_cert.pem tls_key.pem'",
            ));
        }
        Ok(TlsCertKeyPair {
            cert_file: PathBuf::from(parts[0]),
            key_file: PathBuf::from(parts[1]),
        })
    }
}

fn default_http_socks_port() -> u16 {
    DEFAULT_HTTP_SOCKS_PORT
}

fn default_tls_port() -> u16 {
    DEFAULT_TLS_PORT
}

fn default_profiling_port() -> u16 {
    DEFAULT_PROFILING_PORT
}

fn default_final_policy() -> String {
    "direct".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_from_hex() {
        let pw: Password = serde_json::from_str("\"000102030405060708090a0b0c0d0e0f\"").unwrap();
        assert_eq!(pw.raw[0], 0x00);
        assert_eq!(pw.raw[15], 0x0f);
        assert_eq!(pw.hex.len(), 32);
    }

    #[test]
    fn password_rejects_bad_hex() {
        assert!(serde_json::from_str::<Password>("\"short\"").is_err());
        assert!(serde_json::from_str::<Password>("\"zz0102030405060708090a0b0c0d0e0f\"").is_err());
        assert!(serde_json::from_str::<Password>("\"000102030405060708090a0b0c0d0e\"").is_err());
    }

    #[test]
    fn password_debug_is_redacted() {
        let pw: Password = serde_json::from_str("\"000102030405060708090a0b0c0d0e0f\"").unwrap();
        assert_eq!(format!("{:?}", pw), "Password(****)");
    }

    #[test]
    fn cert_key_pair_split() {
        let pair: TlsCertKeyPair = serde_json::from_str("\"cert.pem key.pem\"").unwrap();
        assert_eq!(pair.cert_file, PathBuf::from("cert.pem"));
        assert_eq!(pair.key_file, PathBuf::from("key.pem"));
        assert!(serde_json::from_str::<TlsCertKeyPair>("\"only-one\"").is_err());
    }

    #[test]
    fn defaults_applied() {
        let config: Config = serde_json::from_str(
            r#"{
                "inbounds": {
                    "http-socks": { "host": "::1" },
                    "hg": { "host": "relay.example.com",
                            "password": "000102030405060708090a0b0c0d0e0f" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.inbounds.http_socks.unwrap().port, 1080);
        assert_eq!(config.inbounds.hg.unwrap().tls_port, 443);
        assert_eq!(config.route.final_policy, "direct");
        assert_eq!(config.misc.profiling_port, 6060);
    }

    #[test]
    fn unknown_fields_rejected() {
        let result = serde_json::from_str::<Config>(r#"{ "no-such-field": 1 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn auth_empty_means_none() {
        let config: HttpSocksConfig =
            serde_json::from_str(r#"{ "host": "127.0.0.1" }"#).unwrap();
        assert!(config.auth().is_none());
        let config: HttpSocksConfig =
            serde_json::from_str(r#"{ "host": "127.0.0.1", "username": "u", "password": "p" }"#)
                .unwrap();
        assert_eq!(config.auth(), Some(("u".to_string(), "p".to_string())));
    }
}
