use anyhow::Result;
use tracing::debug;

use crate::common::{Address, ProxyStream};

/// 拒绝出站: 立即以错误终结连接
pub struct RejectClient;

impl RejectClient {
    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        debug!(target = %addr, "reject: connection blocked");
        anyhow::bail!("connection to {} rejected by policy", addr)
    }
}
