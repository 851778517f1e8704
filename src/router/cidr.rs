use std::net::IpAddr;

use anyhow::Result;

use crate::common::error::Error;

/// Interval set over 128-bit keys for CIDR matching.
///
/// IPv4 addresses are widened to their IPv6-mapped form (`::ffff:a.b.c.d`,
/// prefix length + 96) on insertion and lookup, so the set only ever holds
/// and answers 16-byte keys.
pub struct IpCidrSet {
    ranges: Vec<(u128, u128)>,
    finalized: bool,
}

const V4_MAPPED_PREFIX: u128 = 0xffff << 32;

/// Widen an address to its 128-bit key (IPv6-mapped form for IPv4).
pub fn to_mapped_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => V4_MAPPED_PREFIX | u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}

impl IpCidrSet {
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            finalized: false,
        }
    }

    /// Insert a single address (a /32 or /128 prefix).
    pub fn insert_ip(&mut self, ip: IpAddr) {
        let key = to_mapped_u128(ip);
        self.ranges.push((key, key));
        self.finalized = false;
    }

    /// Insert a CIDR prefix. IPv4 prefixes get their length widened by 96.
    pub fn insert_prefix(&mut self, ip: IpAddr, prefix_len: u8) -> Result<()> {
        let (key, mapped_len) = match ip {
            IpAddr::V4(_) => {
                if prefix_len > 32 {
                    return Err(Error::BadRulesStore(format!(
                        "invalid IPv4 prefix length {}",
                        prefix_len
                    ))
                    .into());
                }
                (to_mapped_u128(ip), prefix_len as u32 + 96)
            }
            IpAddr::V6(_) => {
                if prefix_len > 128 {
                    return Err(Error::BadRulesStore(format!(
                        "invalid IPv6 prefix length {}",
                        prefix_len
                    ))
                    .into());
                }
                (to_mapped_u128(ip), prefix_len as u32)
            }
        };

        let host_bits = 128 - mapped_len;
        let (start, end) = if host_bits == 128 {
            (0, u128::MAX)
        } else {
            let start = (key >> host_bits) << host_bits;
            (start, start | ((1u128 << host_bits) - 1))
        };
        self.ranges.push((start, end));
        self.finalized = false;
        Ok(())
    }

    /// Sort and merge the inserted ranges. Must run before lookups;
    /// the matcher calls this once after loading a rule generation.
    pub fn finalize(&mut self) {
        self.ranges.sort_unstable();
        let mut merged: Vec<(u128, u128)> = Vec::with_capacity(self.ranges.len());
        for &(start, end) in &self.ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
        self.finalized = true;
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        debug_assert!(self.finalized || self.ranges.is_empty());
        let key = to_mapped_u128(ip);
        let idx = self.ranges.partition_point(|&(start, _)| start <= key);
        idx > 0 && self.ranges[idx - 1].1 >= key
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
