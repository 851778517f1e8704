pub mod types;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::common::error::Error;

pub use types::{
    Config, HgConfig, HttpSocksConfig, Inbounds, Misc, Password, ProxyNode, RouteConfig,
    RuleConfig, TlsCertKeyPair,
};

/// 读取并解析配置文件，相对路径解析到配置文件所在目录
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::BadConfig(format!("fail to read '{}': {}", path.display(), e)))?;
    let mut config: Config = serde_json::from_str(&content)
        .map_err(|e| Error::BadConfig(format!("fail to parse '{}': {}", path.display(), e)))?;

    let base = path.parent().unwrap_or(Path::new("."));
    resolve_file_paths(&mut config, base);
    validate(&config)?;
    Ok(config)
}

fn resolve_file_paths(config: &mut Config, base: &Path) {
    if let Some(hg) = config.inbounds.hg.as_mut() {
        if let Some(pair) = hg.tls_cert_key_pair.as_mut() {
            pair.cert_file = resolve_to(&pair.cert_file, base);
            pair.key_file = resolve_to(&pair.key_file, base);
        }
        if let Some(dir) = hg.tls_bad_auth_fallback_site_dir.as_mut() {
            *dir = resolve_to(dir, base);
        }
    }
    for node in config.outbounds.values_mut() {
        if let Some(cert) = node.tls_cert.as_mut() {
            *cert = resolve_to(cert, base);
        }
    }
}

fn resolve_to(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn validate(config: &Config) -> Result<()> {
    for rule in &config.route.rules {
        check_policy_name(config, &rule.policy)?;
    }
    check_policy_name(config, &config.route.final_policy)?;

    if let Some(hg) = &config.inbounds.hg {
        // ACME certificate acquisition is an external concern, so a listening
        // carrier server needs an on-disk certificate/key pair.
        if hg.tls_cert_key_pair.is_none() {
            return Err(Error::BadConfig(
                "'inbounds.hg' requires 'tls-cert-key-pair'".into(),
            )
            .into());
        }
    }
    Ok(())
}

fn check_policy_name(config: &Config, policy: &str) -> Result<()> {
    match policy {
        "direct" | "reject" | "final" => Ok(()),
        name if config.outbounds.contains_key(name) => Ok(()),
        name => {
            Err(Error::BadConfig(format!("unknown policy '{}' in 'route'", name)).into())
        }
    }
}
