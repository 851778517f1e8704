use std::net::IpAddr;

use anyhow::Result;
use regex::Regex;

use crate::common::error::Error;
use crate::router::cidr::IpCidrSet;
use crate::router::store::{DomainRuleKind, RulesStore};
use crate::router::trie::DomainTrie;

const DOMAIN_FULL_PREFIX: &str = "domain-full/";
const DOMAIN_SUFFIX_PREFIX: &str = "domain-suffix/";
const DOMAIN_REGEX_PREFIX: &str = "domain-regex/";
const IP_PREFIX: &str = "ip/";
const CIDR_PREFIX: &str = "cidr/";
const DOMAIN_TAG_PREFIX: &str = "domain-tag/";
const IP_SET_TAG_PREFIX: &str = "ip-set-tag/";

/// 一条路由规则的匹配器: 域名 trie + 正则列表 + CIDR 集合。
///
/// 三个子匹配器始终来自同一次 `setup` 调用（同一规则代）。
/// 文本规则保留在 `baked_rules` 中，重载时据此重建而不必重读配置。
pub struct Matcher {
    domain: DomainTrie,
    regexes: Vec<Regex>,
    ip_set: IpCidrSet,
    baked_rules: Vec<String>,
}

impl Matcher {
    pub fn new(baked_rules: Vec<String>) -> Self {
        Self {
            domain: DomainTrie::new(),
            regexes: Vec::new(),
            ip_set: IpCidrSet::new(),
            baked_rules,
        }
    }

    /// 复制出一个只带文本规则的空匹配器，用于重载时重建
    pub fn clone_baked(&self) -> Self {
        Self::new(self.baked_rules.clone())
    }

    /// 是否含有需要规则库的 tag 规则
    pub fn needs_store(&self) -> bool {
        self.baked_rules.iter().any(|rule| {
            rule.starts_with(DOMAIN_TAG_PREFIX) || rule.starts_with(IP_SET_TAG_PREFIX)
        })
    }

    /// 从文本规则装载三个子匹配器
    pub fn setup(&mut self, store: Option<&RulesStore>) -> Result<()> {
        for rule in &self.baked_rules {
            if let Some(domain) = rule.strip_prefix(DOMAIN_FULL_PREFIX) {
                self.domain.insert_full(domain);
            } else if let Some(domain) = rule.strip_prefix(DOMAIN_SUFFIX_PREFIX) {
                self.domain.insert_suffix(domain);
            } else if let Some(pattern) = rule.strip_prefix(DOMAIN_REGEX_PREFIX) {
                self.regexes.push(compile_regex(pattern)?);
            } else if let Some(ip) = rule.strip_prefix(IP_PREFIX) {
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|_| Error::BadConfig(format!("invalid IP in rule '{}'", rule)))?;
                self.ip_set.insert_ip(ip);
            } else if let Some(cidr) = rule.strip_prefix(CIDR_PREFIX) {
                let (ip, bits) = parse_cidr(cidr)
                    .ok_or_else(|| Error::BadConfig(format!("invalid CIDR in rule '{}'", rule)))?;
                self.ip_set.insert_prefix(ip, bits)?;
            } else if let Some(tag) = rule.strip_prefix(DOMAIN_TAG_PREFIX) {
                let store = store.ok_or_else(|| {
                    Error::BadRulesStore(format!("rule '{}' needs the rules database", rule))
                })?;
                let mut regexes = Vec::new();
                let domain = &mut self.domain;
                store.domain_rules_by_tag(tag, |kind, value| match kind {
                    DomainRuleKind::Full => domain.insert_full(value),
                    DomainRuleKind::Suffix => domain.insert_suffix(value),
                    DomainRuleKind::Keyword => {
                        regexes.push(format!("^.*{}.*$", regex::escape(value)))
                    }
                    DomainRuleKind::Regex => regexes.push(value.to_string()),
                })?;
                for pattern in regexes {
                    self.regexes.push(compile_regex(&pattern)?);
                }
            } else if let Some(tag) = rule.strip_prefix(IP_SET_TAG_PREFIX) {
                let store = store.ok_or_else(|| {
                    Error::BadRulesStore(format!("rule '{}' needs the rules database", rule))
                })?;
                let mut cidrs = Vec::new();
                store.ip_set_rules_by_tag(tag, |ip, bits| cidrs.push((ip, bits)))?;
                for (ip, bits) in cidrs {
                    self.ip_set.insert_prefix(ip, bits)?;
                }
            } else {
                return Err(Error::BadConfig(format!("no matched rule item '{}'", rule)).into());
            }
        }
        self.ip_set.finalize();
        Ok(())
    }

    pub fn match_domain(&self, domain: &str) -> bool {
        if self.domain.matches(domain) {
            return true;
        }
        self.regexes.iter().any(|regex| regex.is_match(domain))
    }

    pub fn match_ip(&self, ip: IpAddr) -> bool {
        self.ip_set.contains(ip)
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::BadConfig(format!("invalid domain regex '{}': {}", pattern, e)).into())
}

fn parse_cidr(s: &str) -> Option<(IpAddr, u8)> {
    let (ip, bits) = s.split_once('/')?;
    Some((ip.parse().ok()?, bits.parse().ok()?))
}
