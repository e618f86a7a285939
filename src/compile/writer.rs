//! Native artifact writer.

use fst::Set;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::format::*;
use crate::error::CompileError;
use crate::rule::{CidrBlock, CidrKind, DomainKind, FieldValue, RuleRecord};
use crate::ruleset::RuleSet;

/// Tag of a text value in a field slice
pub(crate) const FIELD_TEXT: u8 = 0;
/// Tag of an integer value in a field slice
pub(crate) const FIELD_INTEGER: u8 = 1;

/// Builder for native artifacts.
pub struct ArtifactWriter {
    layout: u32,
    engine_version: String,
    platform: String,
    slices: Vec<SliceData>,
    dropped: usize,
}

struct SliceData {
    entry: SliceEntry,
    data: Vec<u8>,
}

fn encode_err(e: impl std::fmt::Display) -> CompileError {
    CompileError::Encode(e.to_string())
}

fn count_u32(n: usize) -> Result<u32, CompileError> {
    u32::try_from(n).map_err(|_| encode_err(format!("too many entries: {}", n)))
}

impl ArtifactWriter {
    pub fn new(layout: u32, engine_version: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            layout,
            engine_version: engine_version.into(),
            platform: platform.into(),
            slices: Vec::new(),
            dropped: 0,
        }
    }

    /// Encode a whole rule set.
    ///
    /// Records the layout cannot carry are dropped and counted in
    /// [`ArtifactWriter::dropped`].
    pub fn from_ruleset(
        ruleset: &RuleSet,
        layout: u32,
        engine_version: &str,
        platform: &str,
    ) -> Result<Self, CompileError> {
        let mut domains: BTreeMap<DomainKind, Vec<&str>> = BTreeMap::new();
        let mut cidrs: BTreeMap<(CidrKind, bool), Vec<CidrBlock>> = BTreeMap::new();
        let mut fields: BTreeMap<&str, Vec<&FieldValue>> = BTreeMap::new();
        let mut opaque: Vec<(&str, &str)> = Vec::new();

        for record in ruleset.records() {
            match record {
                RuleRecord::Domain { kind, value } => {
                    domains.entry(*kind).or_default().push(value)
                }
                RuleRecord::Cidr { kind, block } => cidrs
                    .entry((*kind, block.is_ipv4()))
                    .or_default()
                    .push(*block),
                RuleRecord::Field { field, value } => fields.entry(field).or_default().push(value),
                RuleRecord::Opaque { key, json } => opaque.push((key.as_str(), json.as_str())),
            }
        }

        let mut writer = Self::new(layout, engine_version, platform);
        for (kind, values) in &domains {
            writer.add_domain_slice(*kind, values)?;
        }
        for ((kind, _), blocks) in &cidrs {
            writer.add_cidr_slice(*kind, blocks)?;
        }
        for (name, values) in &fields {
            writer.add_field_slice(name, values)?;
        }
        writer.add_opaque_slice(&opaque)?;
        Ok(writer)
    }

    /// Records dropped because the layout cannot carry them.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Add a domain slice.
    ///
    /// Exact and suffix domains are stored as FST sets; suffixes in reversed
    /// form with a leading dot for efficient suffix matching.
    pub fn add_domain_slice(&mut self, kind: DomainKind, values: &[&str]) -> Result<(), CompileError> {
        if values.is_empty() {
            return Ok(());
        }

        let (slice_type, data, count) = match kind {
            DomainKind::Exact | DomainKind::Suffix => {
                let mut keys: Vec<String> = values
                    .iter()
                    .map(|d| {
                        if kind == DomainKind::Suffix {
                            format!(".{}", d).chars().rev().collect::<String>()
                        } else {
                            d.to_string()
                        }
                    })
                    .collect();
                keys.sort();
                keys.dedup();

                let fst_set = Set::from_iter(keys.iter().map(|s| s.as_str()))
                    .map_err(|e| encode_err(format!("failed to build FST: {}", e)))?;
                let slice_type = if kind == DomainKind::Suffix {
                    SliceType::DomainSuffix
                } else {
                    SliceType::DomainExact
                };
                (slice_type, fst_set.as_fst().as_bytes().to_vec(), keys.len())
            }
            DomainKind::Keyword | DomainKind::Regex => {
                let mut sorted = values.to_vec();
                sorted.sort_unstable();
                sorted.dedup();
                let mut data = Vec::new();
                for value in &sorted {
                    put_long_str(&mut data, value).map_err(encode_err)?;
                }
                let slice_type = if kind == DomainKind::Keyword {
                    SliceType::DomainKeyword
                } else {
                    SliceType::DomainRegex
                };
                (slice_type, data, sorted.len())
            }
        };

        let mut entry = SliceEntry::new(slice_type);
        entry.count = count_u32(count)?;
        self.slices.push(SliceData { entry, data });
        Ok(())
    }

    /// Add CIDR slices for one kind; IPv4 and IPv6 blocks go to separate slices.
    pub fn add_cidr_slice(&mut self, kind: CidrKind, blocks: &[CidrBlock]) -> Result<(), CompileError> {
        let mut v4: Vec<([u8; 4], u8)> = Vec::new();
        let mut v6: Vec<([u8; 16], u8)> = Vec::new();
        for block in blocks {
            match block.addr() {
                IpAddr::V4(a) => v4.push((a.octets(), block.prefix())),
                IpAddr::V6(a) => v6.push((a.octets(), block.prefix())),
            }
        }
        v4.sort();
        v4.dedup();
        v6.sort();
        v6.dedup();

        let (t4, t6) = match kind {
            CidrKind::Destination => (SliceType::CidrV4, SliceType::CidrV6),
            CidrKind::Source => (SliceType::SourceCidrV4, SliceType::SourceCidrV6),
        };

        if !v4.is_empty() {
            let mut data = Vec::with_capacity(v4.len() * CIDR_V4_ENTRY_SIZE);
            for (network, prefix_len) in &v4 {
                data.extend_from_slice(network);
                data.push(*prefix_len);
                data.extend_from_slice(&[0u8; 3]); // padding
            }
            let mut entry = SliceEntry::new(t4);
            entry.count = count_u32(v4.len())?;
            self.slices.push(SliceData { entry, data });
        }

        if !v6.is_empty() {
            let mut data = Vec::with_capacity(v6.len() * CIDR_V6_ENTRY_SIZE);
            for (network, prefix_len) in &v6 {
                data.extend_from_slice(network);
                data.push(*prefix_len);
                data.extend_from_slice(&[0u8; 7]); // padding to 24 bytes
            }
            let mut entry = SliceEntry::new(t6);
            entry.count = count_u32(v6.len())?;
            self.slices.push(SliceData { entry, data });
        }
        Ok(())
    }

    /// Add the values of one generic field.
    pub fn add_field_slice(&mut self, name: &str, values: &[&FieldValue]) -> Result<(), CompileError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut sorted = values.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut data = Vec::new();
        put_short_str(&mut data, name).map_err(encode_err)?;
        for value in &sorted {
            match value {
                FieldValue::Text(s) => {
                    data.push(FIELD_TEXT);
                    put_long_str(&mut data, s).map_err(encode_err)?;
                }
                FieldValue::Integer(n) => {
                    data.push(FIELD_INTEGER);
                    data.extend_from_slice(&n.to_le_bytes());
                }
            }
        }

        let mut entry = SliceEntry::new(SliceType::Field);
        entry.count = count_u32(sorted.len())?;
        self.slices.push(SliceData { entry, data });
        Ok(())
    }

    /// Add opaque key/JSON pairs, or drop them if the layout has no room.
    pub fn add_opaque_slice(&mut self, entries: &[(&str, &str)]) -> Result<(), CompileError> {
        if entries.is_empty() {
            return Ok(());
        }
        if !SliceType::Opaque.supported_by(self.layout) {
            log::warn!(
                "layout {} cannot carry opaque records, dropping {}",
                self.layout,
                entries.len()
            );
            self.dropped += entries.len();
            return Ok(());
        }

        let mut sorted = entries.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut data = Vec::new();
        for (key, json) in &sorted {
            put_short_str(&mut data, key).map_err(encode_err)?;
            put_long_str(&mut data, json).map_err(encode_err)?;
        }

        let mut entry = SliceEntry::new(SliceType::Opaque);
        entry.count = count_u32(sorted.len())?;
        self.slices.push(SliceData { entry, data });
        Ok(())
    }

    /// Build the final binary data.
    pub fn build(&mut self) -> Result<Vec<u8>, CompileError> {
        let mut meta = Vec::new();
        put_short_str(&mut meta, &self.engine_version).map_err(encode_err)?;
        put_short_str(&mut meta, &self.platform).map_err(encode_err)?;

        let slice_count = self.slices.len();
        let index_offset = HEADER_SIZE + meta.len();
        let data_start = index_offset + slice_count * SLICE_ENTRY_SIZE;

        // Calculate offsets
        let mut current_offset = data_start;
        let mut record_count = 0usize;
        for slice in &mut self.slices {
            slice.entry.offset = count_u32(current_offset)?;
            slice.entry.size = count_u32(slice.data.len())?;
            current_offset += slice.data.len();
            record_count += slice.entry.count as usize;
        }

        let mut body = Vec::with_capacity(current_offset - HEADER_SIZE);
        body.extend_from_slice(&meta);
        for slice in &self.slices {
            body.extend_from_slice(&slice.entry.to_bytes());
        }
        for slice in &self.slices {
            body.extend_from_slice(&slice.data);
        }

        let mut header = ArtifactHeader::new(self.layout);
        header.slice_count = count_u32(slice_count)?;
        header.record_count = count_u32(record_count)?;
        header.index_offset = count_u32(index_offset)?;
        header.checksum.copy_from_slice(&Sha256::digest(&body));
        if self
            .slices
            .iter()
            .any(|s| s.entry.get_type() == Some(SliceType::Opaque))
        {
            header.flags |= ArtifactFlags::HAS_OPAQUE;
        }

        let mut output = Vec::with_capacity(HEADER_SIZE + body.len());
        output.extend_from_slice(&header.to_bytes());
        output.extend_from_slice(&body);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_empty() {
        let data = ArtifactWriter::new(LAYOUT_V2, "1.11.4", "linux-amd64")
            .build()
            .unwrap();
        assert_eq!(&data[0..8], b"SRSFORGE");
        let header = ArtifactHeader::from_bytes(&data).unwrap();
        assert_eq!(header.slice_count, 0);
        assert_eq!(header.record_count, 0);
        // 2 + "1.11.4" + 2 + "linux-amd64"
        assert_eq!(data.len(), HEADER_SIZE + 2 + 6 + 2 + 11);
    }

    #[test]
    fn test_write_domain_slices() {
        let mut writer = ArtifactWriter::new(LAYOUT_V2, "1.11.4", "linux-amd64");
        writer
            .add_domain_slice(DomainKind::Suffix, &["google.com", "youtube.com"])
            .unwrap();
        writer
            .add_domain_slice(DomainKind::Keyword, &["ads", "ads", "track"])
            .unwrap();
        let data = writer.build().unwrap();

        let header = ArtifactHeader::from_bytes(&data).unwrap();
        assert_eq!(header.slice_count, 2);
        assert_eq!(header.record_count, 4);
    }

    #[test]
    fn test_cidr_families_split() {
        let mut writer = ArtifactWriter::new(LAYOUT_V2, "1.11.4", "linux-amd64");
        let blocks = [
            CidrBlock::parse("10.0.0.0/8").unwrap(),
            CidrBlock::parse("fc00::/7").unwrap(),
        ];
        writer.add_cidr_slice(CidrKind::Destination, &blocks).unwrap();
        let data = writer.build().unwrap();
        let header = ArtifactHeader::from_bytes(&data).unwrap();
        assert_eq!(header.slice_count, 2);
        assert_eq!(
            data.len(),
            header.index_offset as usize
                + 2 * SLICE_ENTRY_SIZE
                + CIDR_V4_ENTRY_SIZE
                + CIDR_V6_ENTRY_SIZE
        );
    }

    #[test]
    fn test_opaque_dropped_in_layout_v1() {
        let mut v1 = ArtifactWriter::new(LAYOUT_V1, "1.9.0", "linux-amd64");
        v1.add_opaque_slice(&[("rule", "{}")]).unwrap();
        assert_eq!(v1.dropped(), 1);
        let header = ArtifactHeader::from_bytes(&v1.build().unwrap()).unwrap();
        assert_eq!(header.slice_count, 0);
        assert!(!header.flags.contains(ArtifactFlags::HAS_OPAQUE));

        let mut v2 = ArtifactWriter::new(LAYOUT_V2, "1.10.0", "linux-amd64");
        v2.add_opaque_slice(&[("rule", "{}")]).unwrap();
        assert_eq!(v2.dropped(), 0);
        let header = ArtifactHeader::from_bytes(&v2.build().unwrap()).unwrap();
        assert!(header.flags.contains(ArtifactFlags::HAS_OPAQUE));
    }

    #[test]
    fn test_build_is_deterministic() {
        let build = || {
            let mut writer = ArtifactWriter::new(LAYOUT_V2, "1.11.4", "linux-amd64");
            writer
                .add_domain_slice(DomainKind::Exact, &["b.com", "a.com"])
                .unwrap();
            writer
                .add_field_slice("port", &[&FieldValue::Integer(443)])
                .unwrap();
            writer.build().unwrap()
        };
        assert_eq!(build(), build());
    }
}
