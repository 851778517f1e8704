use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::tls;
use crate::config::Config;
use crate::proxy::inbound;
use crate::router::{store, Router};

/// 规则库新鲜度检查周期
const RULES_UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

pub struct App {
    config: Config,
    router: Arc<Router>,
    token: CancellationToken,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let router = Arc::new(Router::new(
            &config.route,
            &config.outbounds,
            &config.misc,
        )?);
        Ok(Self {
            config,
            router,
            token: CancellationToken::new(),
        })
    }

    pub async fn run(self) -> Result<()> {
        let token = self.token.clone();

        if self.config.misc.hg_binary_auto_update {
            warn!("'hg-binary-auto-update' is not available in this build; ignoring");
        }
        if self.config.misc.profiling {
            warn!(
                port = self.config.misc.profiling_port,
                "'profiling' is not available in this build; ignoring"
            );
        }
        if self.config.misc.rules_file_auto_update {
            tokio::spawn(rules_update_cron(
                Arc::downgrade(&self.router),
                token.clone(),
            ));
        }

        if let Some(http_socks) = &self.config.inbounds.http_socks {
            let config = http_socks.clone();
            let router = self.router.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = inbound::http_socks::serve(&config, router, token).await {
                    error!(error = %e, "fail to start the HTTP/SOCKS server");
                }
            });
        }

        if let Some(hg) = &self.config.inbounds.hg {
            {
                let hg = hg.clone();
                let router = self.router.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = inbound::tls_carrier::serve(&hg, router, token).await {
                        error!(error = %e, "fail to start the TLS carrier server");
                    }
                });
            }
            if hg.tcp_port.is_some() {
                let hg = hg.clone();
                let router = self.router.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = inbound::aead::serve(&hg, router, token).await {
                        error!(error = %e, "fail to start the AEAD carrier server");
                    }
                });
            }
            if hg.quic_port.is_some() {
                let hg = hg.clone();
                let router = self.router.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = inbound::tuic::serve(&hg, router, token).await {
                        error!(error = %e, "fail to start the QUIC carrier server");
                    }
                });
            }
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        token.cancel();
        if self.config.misc.tls_key_log {
            tls::remove_key_log_file();
        }
        Ok(())
    }
}

/// 周期检查规则库文件是否更新；变了就触发路由器的原子重载。
/// 经 Weak 持有路由器，避免 router ↔ 更新任务相互保活。
async fn rules_update_cron(router: Weak<Router>, token: CancellationToken) {
    let path = match store::default_rules_db_path() {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "fail to locate the rules database");
            return;
        }
    };
    let mut last_seen: Option<SystemTime> = modified_time(&path);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RULES_UPDATE_CHECK_INTERVAL) => {}
        }
        let router = match router.upgrade() {
            Some(router) => router,
            None => return,
        };
        let modified = modified_time(&path);
        if modified == last_seen {
            continue;
        }
        last_seen = modified;
        match router.reload_rules() {
            Ok(()) => info!("update rules' files successfully"),
            Err(e) => warn!(error = %e, "fail to update rules' matchers"),
        }
    }
}

fn modified_time(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
