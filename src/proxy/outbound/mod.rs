pub mod aead;
pub mod direct;
pub mod reject;
pub mod tls_carrier;
pub mod tuic;

use anyhow::Result;

use crate::common::{Address, ProxyStream};
use crate::config::ProxyNode;

/// 出站终端。集合封闭且很小，用和类型而非开放多态。
pub enum Outbound {
    Direct(direct::DirectClient),
    Reject(reject::RejectClient),
    Aead(aead::AeadClient),
    Tls(tls_carrier::TlsCarrierClient),
    Quic(tuic::TuicClient),
}

impl Outbound {
    pub fn direct() -> Self {
        Outbound::Direct(direct::DirectClient)
    }

    pub fn reject() -> Self {
        Outbound::Reject(reject::RejectClient)
    }

    /// 节点端口决定载体: quic-port → TUIC，tcp-port → AEAD/TCP，
    /// 否则 TLS 载体（tls-port，默认 443）
    pub fn from_node(node: &ProxyNode, tls_key_log: bool) -> Result<Self> {
        if node.quic_port.is_some() {
            Ok(Outbound::Quic(tuic::TuicClient::new(node, tls_key_log)?))
        } else if node.tcp_port.is_some() {
            Ok(Outbound::Aead(aead::AeadClient::new(node)?))
        } else {
            Ok(Outbound::Tls(tls_carrier::TlsCarrierClient::new(
                node,
                tls_key_log,
            )?))
        }
    }

    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        match self {
            Outbound::Direct(client) => client.dial(addr).await,
            Outbound::Reject(client) => client.dial(addr).await,
            Outbound::Aead(client) => client.dial(addr).await,
            Outbound::Tls(client) => client.dial(addr).await,
            Outbound::Quic(client) => client.dial(addr).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Password;

    fn node(tcp: Option<u16>, quic: Option<u16>) -> ProxyNode {
        ProxyNode {
            host: "relay.example.com".to_string(),
            password: serde_json::from_str::<Password>("\"000102030405060708090a0b0c0d0e0f\"")
                .unwrap(),
            tls_port: 443,
            tcp_port: tcp,
            quic_port: quic,
            tls_cert: None,
        }
    }

    #[test]
    fn carrier_selection_by_ports() {
        assert!(matches!(
            Outbound::from_node(&node(None, Some(8443)), false).unwrap(),
            Outbound::Quic(_)
        ));
        assert!(matches!(
            Outbound::from_node(&node(Some(8388), None), false).unwrap(),
            Outbound::Aead(_)
        ));
        assert!(matches!(
            Outbound::from_node(&node(None, None), false).unwrap(),
            Outbound::Tls(_)
        ));
        // quic wins over tcp when both are configured
        assert!(matches!(
            Outbound::from_node(&node(Some(8388), Some(8443)), false).unwrap(),
            Outbound::Quic(_)
        ));
    }
}
