//! Native artifact reader.
//!
//! Used to verify compiled artifacts and by the `inspect` command.

use fst::Set;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::format::*;
use super::writer::{FIELD_INTEGER, FIELD_TEXT};
use crate::rule::{CidrBlock, CidrKind, DomainKind, FieldValue, RuleRecord};
use crate::{Error, Result};

/// Reader for native artifacts.
pub struct ArtifactReader {
    data: Vec<u8>,
    header: ArtifactHeader,
    engine_version: String,
    platform: String,
    entries: Vec<SliceEntry>,
}

impl ArtifactReader {
    /// Load and verify an artifact.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = ArtifactHeader::from_bytes(data)?;
        header.validate()?;

        let body = &data[HEADER_SIZE..];
        if header.flags.contains(ArtifactFlags::CHECKSUMMED)
            && Sha256::digest(body)[..] != header.checksum[..]
        {
            return Err(Error::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(body);
        let engine_version = cursor.short_str()?;
        let platform = cursor.short_str()?;

        let index_offset = header.index_offset as usize;
        let slice_count = header.slice_count as usize;
        let entries_end = slice_count
            .checked_mul(SLICE_ENTRY_SIZE)
            .and_then(|n| n.checked_add(index_offset))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| Error::Truncated("slice index".to_string()))?;

        let mut entries = Vec::with_capacity(slice_count);
        for offset in (index_offset..entries_end).step_by(SLICE_ENTRY_SIZE) {
            let entry = SliceEntry::from_bytes(&data[offset..offset + SLICE_ENTRY_SIZE]);
            let end = (entry.offset as usize).checked_add(entry.size as usize);
            if end.map_or(true, |end| end > data.len()) {
                return Err(Error::Truncated(format!(
                    "slice {:#04x} at offset {}",
                    entry.slice_type, entry.offset
                )));
            }
            entries.push(entry);
        }

        Ok(Self {
            data: data.to_vec(),
            header,
            engine_version,
            platform,
            entries,
        })
    }

    pub fn layout(&self) -> u32 {
        self.header.layout
    }

    pub fn flags(&self) -> ArtifactFlags {
        self.header.flags
    }

    /// Engine version the artifact was compiled for.
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Get number of slices.
    pub fn slice_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of records, as recorded in the header.
    pub fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    /// Slice types and entry counts in file order.
    pub fn slices(&self) -> Vec<(Option<SliceType>, u32)> {
        self.entries.iter().map(|e| (e.get_type(), e.count)).collect()
    }

    fn slice_data(&self, entry: &SliceEntry) -> &[u8] {
        let offset = entry.offset as usize;
        &self.data[offset..offset + entry.size as usize]
    }

    /// Decode every record.
    pub fn records(&self) -> Result<Vec<RuleRecord>> {
        let mut out = Vec::with_capacity(self.record_count());
        for entry in &self.entries {
            let data = self.slice_data(entry);
            match entry.get_type() {
                Some(SliceType::DomainExact) => {
                    for key in fst_keys(data)? {
                        out.push(RuleRecord::domain(DomainKind::Exact, key));
                    }
                }
                Some(SliceType::DomainSuffix) => {
                    for key in fst_keys(data)? {
                        let domain: String = key.chars().rev().collect();
                        let domain = domain.strip_prefix('.').unwrap_or(&domain).to_string();
                        out.push(RuleRecord::domain(DomainKind::Suffix, domain));
                    }
                }
                Some(SliceType::DomainKeyword) => {
                    for value in long_strs(data, entry.count)? {
                        out.push(RuleRecord::domain(DomainKind::Keyword, value));
                    }
                }
                Some(SliceType::DomainRegex) => {
                    for value in long_strs(data, entry.count)? {
                        out.push(RuleRecord::domain(DomainKind::Regex, value));
                    }
                }
                Some(t @ (SliceType::CidrV4 | SliceType::SourceCidrV4)) => {
                    let kind = cidr_kind(t);
                    for (network, prefix) in cidrs_v4(data, entry.count) {
                        let block = CidrBlock::new(IpAddr::V4(Ipv4Addr::from(network)), prefix);
                        out.push(RuleRecord::Cidr { kind, block });
                    }
                }
                Some(t @ (SliceType::CidrV6 | SliceType::SourceCidrV6)) => {
                    let kind = cidr_kind(t);
                    for (network, prefix) in cidrs_v6(data, entry.count) {
                        let block = CidrBlock::new(IpAddr::V6(Ipv6Addr::from(network)), prefix);
                        out.push(RuleRecord::Cidr { kind, block });
                    }
                }
                Some(SliceType::Field) => {
                    let mut cursor = Cursor::new(data);
                    let name = cursor.short_str()?;
                    for _ in 0..entry.count {
                        let value = match cursor.u8()? {
                            FIELD_TEXT => FieldValue::Text(cursor.long_str()?),
                            FIELD_INTEGER => FieldValue::Integer(cursor.i64()?),
                            tag => {
                                return Err(Error::Truncated(format!("unknown field tag {}", tag)))
                            }
                        };
                        out.push(RuleRecord::field(name.clone(), value));
                    }
                }
                Some(SliceType::Opaque) => {
                    let mut cursor = Cursor::new(data);
                    for _ in 0..entry.count {
                        let key = cursor.short_str()?;
                        let json = cursor.long_str()?;
                        out.push(RuleRecord::Opaque { key, json });
                    }
                }
                None => {
                    log::warn!("skipping unknown slice type {:#04x}", entry.slice_type);
                }
            }
        }
        Ok(out)
    }

    /// Whether a destination CIDR slice contains `ip`.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.entries.iter().any(|entry| match (entry.get_type(), ip) {
            (Some(SliceType::CidrV4), IpAddr::V4(v4)) => {
                let ip = u32::from(v4);
                cidrs_v4(self.slice_data(entry), entry.count).any(|(network, prefix_len)| {
                    let mask = if prefix_len == 0 {
                        0
                    } else if prefix_len >= 32 {
                        !0u32
                    } else {
                        !0u32 << (32 - prefix_len)
                    };
                    (ip & mask) == (u32::from_be_bytes(network) & mask)
                })
            }
            (Some(SliceType::CidrV6), IpAddr::V6(v6)) => {
                let ip = v6.octets();
                cidrs_v6(self.slice_data(entry), entry.count)
                    .any(|(network, prefix_len)| matches_ipv6_cidr(&ip, &network, prefix_len))
            }
            _ => false,
        })
    }

    /// Whether any domain slice matches `domain`.
    pub fn matches_domain(&self, domain: &str) -> bool {
        let normalized = domain.trim().to_lowercase();
        self.entries.iter().any(|entry| {
            let data = self.slice_data(entry);
            match entry.get_type() {
                Some(SliceType::DomainExact) => {
                    Set::new(data.to_vec()).map_or(false, |set| set.contains(&normalized))
                }
                Some(SliceType::DomainSuffix) => match_suffix(data, &normalized),
                Some(SliceType::DomainKeyword) => long_strs(data, entry.count)
                    .map_or(false, |kws| kws.iter().any(|k| normalized.contains(k.as_str()))),
                Some(SliceType::DomainRegex) => long_strs(data, entry.count).map_or(false, |res| {
                    res.iter()
                        .filter_map(|r| Regex::new(r).ok())
                        .any(|re| re.is_match(&normalized))
                }),
                _ => false,
            }
        })
    }
}

fn cidr_kind(t: SliceType) -> CidrKind {
    match t {
        SliceType::SourceCidrV4 | SliceType::SourceCidrV6 => CidrKind::Source,
        _ => CidrKind::Destination,
    }
}

fn fst_keys(data: &[u8]) -> Result<Vec<String>> {
    let set = Set::new(data.to_vec()).map_err(|e| Error::Truncated(format!("bad FST: {}", e)))?;
    let keys = set
        .stream()
        .into_strs()
        .map_err(|e| Error::Truncated(format!("bad FST key: {}", e)))?;
    Ok(keys)
}

fn long_strs(data: &[u8], count: u32) -> Result<Vec<String>> {
    let mut cursor = Cursor::new(data);
    (0..count).map(|_| cursor.long_str()).collect()
}

fn cidrs_v4(data: &[u8], count: u32) -> impl Iterator<Item = ([u8; 4], u8)> + '_ {
    data.chunks_exact(CIDR_V4_ENTRY_SIZE)
        .take(count as usize)
        .map(|chunk| ([chunk[0], chunk[1], chunk[2], chunk[3]], chunk[4]))
}

fn cidrs_v6(data: &[u8], count: u32) -> impl Iterator<Item = ([u8; 16], u8)> + '_ {
    data.chunks_exact(CIDR_V6_ENTRY_SIZE)
        .take(count as usize)
        .map(|chunk| {
            let mut network = [0u8; 16];
            network.copy_from_slice(&chunk[..16]);
            (network, chunk[16])
        })
}

fn matches_ipv6_cidr(ip: &[u8; 16], network: &[u8; 16], prefix_len: u8) -> bool {
    let prefix_len = prefix_len.min(128);
    let full_bytes = prefix_len as usize / 8;
    let remaining_bits = prefix_len as usize % 8;

    if full_bytes > 0 && ip[..full_bytes] != network[..full_bytes] {
        return false;
    }

    if remaining_bits > 0 && full_bytes < 16 {
        let mask = 0xFFu8 << (8 - remaining_bits);
        if (ip[full_bytes] & mask) != (network[full_bytes] & mask) {
            return false;
        }
    }

    true
}

/// Check the domain and its parents against a reversed-suffix FST.
fn match_suffix(data: &[u8], domain: &str) -> bool {
    let Ok(fst) = Set::new(data.to_vec()) else {
        return false;
    };

    let parts: Vec<&str> = domain.split('.').collect();
    (0..parts.len()).any(|i| {
        let suffix_with_dot = format!(".{}", parts[i..].join("."));
        let reversed: String = suffix_with_dot.chars().rev().collect();
        fst.contains(&reversed)
    })
}
