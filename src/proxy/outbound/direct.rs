use anyhow::Result;
use tracing::debug;

use crate::common::{net, Address, ProxyStream};

/// 直连出站: 直接向目标地址发起 TCP 连接
pub struct DirectClient;

impl DirectClient {
    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        debug!(target = %addr, "direct connect");
        let stream = net::dial_tcp(addr).await?;
        Ok(Box::new(stream))
    }
}
