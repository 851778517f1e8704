pub mod cidr;
pub mod matcher;
pub mod store;
pub mod trie;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Result;
use tracing::info;

use crate::common::{Address, Error, ProxyStream};
use crate::config::{Misc, ProxyNode, RouteConfig};
use crate::proxy::outbound::Outbound;
use matcher::Matcher;
use store::RulesStore;

pub struct Rule {
    pub matcher: Matcher,
    pub policy: String,
}

struct RouteTable {
    rules: Vec<Rule>,
    final_policy: String,
}

/// 路由器: 按第一条命中规则选择策略，再委托对应出站拨号。
///
/// 规则表由读写锁保护；读者并发查表，重载时先在锁外重建全部匹配器，
/// 再持写锁整体替换，读者不会看到构建了一半的匹配器。
pub struct Router {
    table: RwLock<RouteTable>,
    outbounds: HashMap<String, Outbound>,
    rules_db_path: Option<PathBuf>,
}

impl Router {
    pub fn new(
        route: &RouteConfig,
        nodes: &HashMap<String, ProxyNode>,
        misc: &Misc,
    ) -> Result<Self> {
        let mut outbounds = HashMap::new();
        outbounds.insert("direct".to_string(), Outbound::direct());
        outbounds.insert("reject".to_string(), Outbound::reject());
        for (name, node) in nodes {
            if name == "direct" || name == "reject" || name == "final" {
                return Err(
                    Error::BadConfig(format!("outbound name '{}' is reserved", name)).into(),
                );
            }
            outbounds.insert(name.clone(), Outbound::from_node(node, misc.tls_key_log)?);
        }

        let mut rules: Vec<Rule> = route
            .rules
            .iter()
            .map(|cfg| Rule {
                matcher: Matcher::new(cfg.match_rules.clone()),
                policy: cfg.policy.clone(),
            })
            .collect();
        let rules_db_path = store::default_rules_db_path().ok();
        setup_matchers(&mut rules, rules_db_path.as_deref())?;

        Ok(Self {
            table: RwLock::new(RouteTable {
                rules,
                final_policy: route.final_policy.clone(),
            }),
            outbounds,
            rules_db_path,
        })
    }

    /// 查表得到策略名。IP 目标走 `match_ip`，域名目标走 `match_domain`；
    /// 空策略与 `"final"` 回落到兜底策略。
    pub fn pick_policy(&self, addr: &Address) -> String {
        let table = self.table.read().unwrap();
        let mut policy = "";
        match addr {
            Address::Ip(sock_addr) => {
                for rule in &table.rules {
                    if rule.matcher.match_ip(sock_addr.ip()) {
                        policy = &rule.policy;
                        break;
                    }
                }
            }
            Address::Domain(domain, _) => {
                for rule in &table.rules {
                    if rule.matcher.match_domain(domain) {
                        policy = &rule.policy;
                        break;
                    }
                }
            }
        }
        if policy.is_empty() || policy == "final" {
            policy = &table.final_policy;
        }
        policy.to_string()
    }

    /// 为目标地址选择策略并建立出站连接
    pub async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        let policy = self.pick_policy(addr);
        info!(access = %addr, policy = %policy, "route");
        let outbound = self
            .outbounds
            .get(&policy)
            .ok_or_else(|| Error::BadConfig(format!("unknown policy '{}'", policy)))?;
        outbound.dial(addr).await
    }

    /// 原子重载: 持读锁复制文本规则，锁外重建匹配器（重新读库），
    /// 再持写锁替换整个规则向量
    pub fn reload_rules(&self) -> Result<()> {
        let mut new_rules: Vec<Rule> = {
            let table = self.table.read().unwrap();
            table
                .rules
                .iter()
                .map(|rule| Rule {
                    matcher: rule.matcher.clone_baked(),
                    policy: rule.policy.clone(),
                })
                .collect()
        };
        setup_matchers(&mut new_rules, self.rules_db_path.as_deref())?;

        let mut table = self.table.write().unwrap();
        table.rules = new_rules;
        Ok(())
    }
}

fn setup_matchers(rules: &mut [Rule], rules_db_path: Option<&std::path::Path>) -> Result<()> {
    let store = if rules.iter().any(|rule| rule.matcher.needs_store()) {
        let path = rules_db_path.ok_or_else(|| {
            Error::BadRulesStore("tag rules need the rules database path".into())
        })?;
        Some(RulesStore::open(path)?)
    } else {
        None
    };
    for rule in rules {
        rule.matcher.setup(store.as_ref())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    fn router_of(rules: Vec<RuleConfig>, final_policy: &str) -> Router {
        let route = RouteConfig {
            rules,
            final_policy: final_policy.to_string(),
        };
        Router::new(&route, &HashMap::new(), &Misc::default()).unwrap()
    }

    fn rule(matches: &[&str], policy: &str) -> RuleConfig {
        RuleConfig {
            match_rules: matches.iter().map(|s| s.to_string()).collect(),
            policy: policy.to_string(),
        }
    }

    #[test]
    fn first_match_wins() {
        let router = router_of(
            vec![
                rule(&["domain-suffix/example.com"], "reject"),
                rule(&["domain-full/a.example.com"], "direct"),
            ],
            "direct",
        );
        // both rules match, the lowest-indexed one wins
        assert_eq!(
            router.pick_policy(&Address::Domain("a.example.com".into(), 443)),
            "reject"
        );
    }

    #[test]
    fn falls_back_to_final() {
        let router = router_of(vec![rule(&["domain-suffix/example.com"], "reject")], "direct");
        assert_eq!(
            router.pick_policy(&Address::Domain("other.org".into(), 443)),
            "direct"
        );
    }

    #[test]
    fn final_policy_name_resolves() {
        let router = router_of(vec![rule(&["domain-suffix/example.com"], "final")], "reject");
        assert_eq!(
            router.pick_policy(&Address::Domain("www.example.com".into(), 443)),
            "reject"
        );
    }

    #[test]
    fn ip_destination_uses_ip_matcher() {
        let router = router_of(
            vec![
                rule(&["domain-suffix/example.com"], "reject"),
                rule(&["cidr/10.0.0.0/8"], "reject"),
            ],
            "direct",
        );
        assert_eq!(
            router.pick_policy(&Address::Ip("10.1.2.3:80".parse().unwrap())),
            "reject"
        );
        assert_eq!(
            router.pick_policy(&Address::Ip("8.8.8.8:53".parse().unwrap())),
            "direct"
        );
    }

    #[test]
    fn reload_swaps_atomically() {
        let router = router_of(vec![rule(&["domain-suffix/example.com"], "reject")], "direct");
        let addr = Address::Domain("www.example.com".into(), 80);
        assert_eq!(router.pick_policy(&addr), "reject");

        router.reload_rules().unwrap();
        // the rebuilt generation behaves identically
        assert_eq!(router.pick_policy(&addr), "reject");
        assert_eq!(
            router.pick_policy(&Address::Domain("other.org".into(), 80)),
            "direct"
        );
    }

    #[tokio::test]
    async fn reject_policy_fails_dial() {
        let router = router_of(vec![rule(&["domain-suffix/example.com"], "reject")], "direct");
        let result = router
            .dial(&Address::Domain("www.example.com".into(), 80))
            .await;
        assert!(result.is_err());
    }
}
