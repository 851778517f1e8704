pub mod inbound;
pub mod outbound;
pub mod relay;

use anyhow::Result;

use crate::common::{Address, ProxyStream};
use crate::router::Router;

/// 入站协议解析完成后的统一出口: 按路由拨号并开始双向转发。
/// 拨号失败时入站流随返回值一起关闭。
pub async fn forward_tcp(router: &Router, addr: &Address, inbound: ProxyStream) -> Result<()> {
    let outbound = router.dial(addr).await?;
    relay::pipe(inbound, outbound).await
}
