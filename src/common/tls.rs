use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context as _, Result};
use rustls::pki_types::ServerName;
use tracing::warn;

use crate::common::error::Error;

/// TLS key log 文件路径，进程退出时删除
pub const TLS_KEY_LOG_FILEPATH: &str = "logs/tls_key.log";

fn client_config_cache() -> &'static Mutex<HashMap<String, Arc<rustls::ClientConfig>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<rustls::ClientConfig>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// 构建（并按远端 host 缓存）TLS 客户端配置。
///
/// 配置了 `tls-cert` 时该证书成为唯一信任锚（自签名部署），否则使用
/// webpki 根证书。
pub fn client_config(
    host: &str,
    pinned_cert: Option<&Path>,
    key_log: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut cache = client_config_cache().lock().unwrap();
    if let Some(config) = cache.get(host) {
        return Ok(config.clone());
    }

    let mut roots = rustls::RootCertStore::empty();
    match pinned_cert {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| Error::BadConfig(format!("fail to load the TLS certificate file: {}", e)))?;
            let mut reader = BufReader::new(file);
            let mut added = 0;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| Error::BadConfig(format!("fail to decode the TLS certificate file: {}", e)))?;
                roots.add(cert).map_err(|e| {
                    Error::BadConfig(format!("fail to add the pinned TLS certificate: {}", e))
                })?;
                added += 1;
            }
            if added == 0 {
                return Err(
                    Error::BadConfig("no certificate found in the TLS certificate file".into())
                        .into(),
                );
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if key_log {
        config.key_log = key_log_writer()?;
    }

    let config = Arc::new(config);
    cache.insert(host.to_string(), config.clone());
    Ok(config)
}

/// 从 PEM 证书/私钥对构建 TLS 服务端配置
pub fn server_config(cert_file: &Path, key_file: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = {
        let file = File::open(cert_file)
            .map_err(|e| Error::BadConfig(format!("fail to load the TLS certificate file: {}", e)))?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::BadConfig(format!("fail to decode the TLS certificate file: {}", e)))?
    };
    let key = {
        let file = File::open(key_file)
            .map_err(|e| Error::BadConfig(format!("fail to load the TLS key file: {}", e)))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| Error::BadConfig(format!("fail to decode the TLS key file: {}", e)))?
            .ok_or_else(|| Error::BadConfig("no private key found in the TLS key file".into()))?
    };
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::BadConfig(format!("fail to load TLS certificate/key pair: {}", e)))?;
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::BadAddress(format!("invalid TLS server name '{}'", host)).into())
}

/// NSS key-log 格式写入器，供 Wireshark 等工具解密抓包
#[derive(Debug)]
struct FileKeyLog {
    file: Mutex<File>,
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + 1 + client_random.len() * 2 + 1 + secret.len() * 2 + 1);
        line.push_str(label);
        line.push(' ');
        for b in client_random {
            line.push_str(&format!("{:02x}", b));
        }
        line.push(' ');
        for b in secret {
            line.push_str(&format!("{:02x}", b));
        }
        line.push('\n');
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

fn key_log_writer() -> Result<Arc<dyn rustls::KeyLog>> {
    static WRITER: OnceLock<Arc<dyn rustls::KeyLog>> = OnceLock::new();
    if let Some(writer) = WRITER.get() {
        return Ok(writer.clone());
    }
    if let Some(dir) = Path::new(TLS_KEY_LOG_FILEPATH).parent() {
        std::fs::create_dir_all(dir).context("fail to create the TLS key log directory")?;
    }
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(TLS_KEY_LOG_FILEPATH)
        .context("fail to open the TLS key log file")?;
    let writer: Arc<dyn rustls::KeyLog> = Arc::new(FileKeyLog {
        file: Mutex::new(file),
    });
    Ok(WRITER.get_or_init(|| writer).clone())
}

/// 退出时删除 key log 文件
pub fn remove_key_log_file() {
    if Path::new(TLS_KEY_LOG_FILEPATH).exists() {
        if let Err(e) = std::fs::remove_file(TLS_KEY_LOG_FILEPATH) {
            warn!(path = TLS_KEY_LOG_FILEPATH, error = %e, "fail to remove the file");
        }
    }
}
