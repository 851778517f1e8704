use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};

use crate::common::error::Error;

/// 批量规则库文件名，位于可执行文件旁
pub const RULES_DB_FILENAME: &str = "domain-ip-set-rules.db";

const DOMAIN_RULES_QUERY: &str = "
select type_id, value
from domains,
     json_each(domains.domains) domain
         join domain_tags on domains.tag_id = domain_tags.id
where domain_tags.name = ?
";

const IP_SET_RULES_QUERY: &str = "
select type_id, cidrs
from ip_sets
         join ip_set_tags on ip_sets.tag_id = ip_set_tags.id
where ip_set_tags.name = ?
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRuleKind {
    Full,
    Suffix,
    Keyword,
    Regex,
}

/// 只读打开的规则库。启动（或重载）时一次性读入内存匹配器后即关闭，
/// 运行期查询只走 trie/CIDR。
pub struct RulesStore {
    conn: Connection,
}

/// 规则库的默认路径: 可执行文件所在目录
pub fn default_rules_db_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::BadRulesStore("executable has no parent directory".into()))?;
    Ok(dir.join(RULES_DB_FILENAME))
}

impl RulesStore {
    pub fn open(path: &Path) -> Result<Self> {
        // rusqlite would create a missing file without this check
        if !path.exists() {
            return Err(Error::BadRulesStore(format!(
                "rules database '{}' not found",
                path.display()
            ))
            .into());
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| Error::BadRulesStore(format!("fail to open '{}': {}", path.display(), e)))?;
        Ok(Self { conn })
    }

    /// 按 tag 读出域名规则，type_id: 0=full, 1=suffix, 2=keyword, 3=regex
    pub fn domain_rules_by_tag(
        &self,
        tag: &str,
        mut consumer: impl FnMut(DomainRuleKind, &str),
    ) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(DOMAIN_RULES_QUERY)
            .map_err(|e| Error::BadRulesStore(e.to_string()))?;
        let mut rows = stmt
            .query([tag])
            .map_err(|e| Error::BadRulesStore(e.to_string()))?;

        let mut at_least_one_row = false;
        while let Some(row) = rows.next().map_err(|e| Error::BadRulesStore(e.to_string()))? {
            at_least_one_row = true;
            let type_id: i64 = row.get(0).map_err(|e| Error::BadRulesStore(e.to_string()))?;
            let value: String = row.get(1).map_err(|e| Error::BadRulesStore(e.to_string()))?;
            let kind = match type_id {
                0 => DomainRuleKind::Full,
                1 => DomainRuleKind::Suffix,
                2 => DomainRuleKind::Keyword,
                3 => DomainRuleKind::Regex,
                other => {
                    return Err(Error::BadRulesStore(format!(
                        "invalid domain type {} when querying domain rules by tag 'domain-tag/{}'",
                        other, tag
                    ))
                    .into())
                }
            };
            consumer(kind, &value);
        }

        if !at_least_one_row {
            return Err(Error::BadRulesStore(format!(
                "no domain found when querying domain rules by tag 'domain-tag/{}'",
                tag
            ))
            .into());
        }
        Ok(())
    }

    /// 按 tag 读出 CIDR 规则。记录为紧凑字节串:
    /// type_id 0 = IPv4, 每条 5 字节 (地址 4 + 前缀长 1);
    /// type_id 1 = IPv6, 每条 17 字节 (地址 16 + 前缀长 1)。
    pub fn ip_set_rules_by_tag(
        &self,
        tag: &str,
        mut consumer: impl FnMut(IpAddr, u8),
    ) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(IP_SET_RULES_QUERY)
            .map_err(|e| Error::BadRulesStore(e.to_string()))?;
        let mut rows = stmt
            .query([tag])
            .map_err(|e| Error::BadRulesStore(e.to_string()))?;

        let mut at_least_one_row = false;
        while let Some(row) = rows.next().map_err(|e| Error::BadRulesStore(e.to_string()))? {
            at_least_one_row = true;
            let type_id: i64 = row.get(0).map_err(|e| Error::BadRulesStore(e.to_string()))?;
            let cidrs: Vec<u8> = row.get(1).map_err(|e| Error::BadRulesStore(e.to_string()))?;
            match type_id {
                0 => consume_cidr_bytes::<4>(&cidrs, tag, &mut consumer)?,
                1 => consume_cidr_bytes::<16>(&cidrs, tag, &mut consumer)?,
                other => {
                    return Err(Error::BadRulesStore(format!(
                        "invalid CIDR type {} when querying IP set rules by tag 'ip-set-tag/{}'",
                        other, tag
                    ))
                    .into())
                }
            }
        }

        if !at_least_one_row {
            return Err(Error::BadRulesStore(format!(
                "no CIDR found when querying IP set rules by tag 'ip-set-tag/{}'",
                tag
            ))
            .into());
        }
        Ok(())
    }
}

fn consume_cidr_bytes<const N: usize>(
    bytes: &[u8],
    tag: &str,
    consumer: &mut impl FnMut(IpAddr, u8),
) -> Result<()> {
    let record_size = N + 1;
    if bytes.len() % record_size != 0 {
        return Err(Error::BadRulesStore(format!(
            "invalid IPv{} CIDR bytes length {} when querying IP set rules by tag '{}'",
            if N == 4 { 4 } else { 6 },
            bytes.len(),
            tag
        ))
        .into());
    }
    for record in bytes.chunks_exact(record_size) {
        let ip = match N {
            4 => IpAddr::V4(Ipv4Addr::new(record[0], record[1], record[2], record[3])),
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&record[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        consumer(ip, record[record_size - 1]);
    }
    Ok(())
}
