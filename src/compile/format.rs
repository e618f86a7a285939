//! Native artifact format.
//!
//! File structure:
//! ```text
//! +--------------------+
//! |  HEADER (64 bytes) |  Magic "SRSFORGE", layout, flags, counts, checksum
//! +--------------------+
//! |  TARGET METADATA   |  Engine version and platform strings
//! +--------------------+
//! |  SLICE INDEX       |  Array of SliceEntry (type, offset, size, count)
//! +--------------------+
//! |  SLICE 0 DATA      |  FST, sorted strings or fixed-width CIDRs
//! +--------------------+
//! |      ...           |
//! +--------------------+
//! ```
//!
//! All integers are little-endian except CIDR network addresses, which are
//! stored big-endian so entries sort bytewise. The checksum covers every
//! byte after the header. Nothing time-dependent is written, so the same
//! rule set always encodes to the same bytes.

use bitflags::bitflags;

use crate::{Error, Result};

/// Magic bytes of a native artifact
pub const MAGIC: [u8; 8] = *b"SRSFORGE";

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Slice index entry size in bytes
pub const SLICE_ENTRY_SIZE: usize = 16;

/// Layout for engines 1.8.x and 1.9.x: no opaque records
pub const LAYOUT_V1: u32 = 1;

/// Layout for engines 1.10.x to 1.12.x
pub const LAYOUT_V2: u32 = 2;

/// IPv4 CIDR entry: network (4, BE) + prefix (1) + padding (3)
pub const CIDR_V4_ENTRY_SIZE: usize = 8;

/// IPv6 CIDR entry: network (16) + prefix (1) + padding (7)
pub const CIDR_V6_ENTRY_SIZE: usize = 24;

bitflags! {
    /// Artifact header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArtifactFlags: u32 {
        /// Header carries a SHA-256 of the body
        const CHECKSUMMED = 0b0000_0001;
        /// Artifact contains an opaque slice
        const HAS_OPAQUE = 0b0000_0010;
    }
}

/// Slice type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SliceType {
    /// FST set of exact domains
    DomainExact = 0x01,
    /// FST set of reversed `.domain` suffixes
    DomainSuffix = 0x02,
    /// Sorted length-prefixed keywords
    DomainKeyword = 0x03,
    /// Sorted length-prefixed regex patterns
    DomainRegex = 0x04,
    /// Destination IPv4 CIDR ranges
    CidrV4 = 0x05,
    /// Destination IPv6 CIDR ranges
    CidrV6 = 0x06,
    /// Source IPv4 CIDR ranges
    SourceCidrV4 = 0x07,
    /// Source IPv6 CIDR ranges
    SourceCidrV6 = 0x08,
    /// Values of one generic field, name stored in the slice
    Field = 0x09,
    /// Pass-through key/JSON pairs
    Opaque = 0x0A,
}

impl SliceType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::DomainExact),
            0x02 => Some(Self::DomainSuffix),
            0x03 => Some(Self::DomainKeyword),
            0x04 => Some(Self::DomainRegex),
            0x05 => Some(Self::CidrV4),
            0x06 => Some(Self::CidrV6),
            0x07 => Some(Self::SourceCidrV4),
            0x08 => Some(Self::SourceCidrV6),
            0x09 => Some(Self::Field),
            0x0A => Some(Self::Opaque),
            _ => None,
        }
    }

    /// Whether this layout can carry the slice type.
    pub fn supported_by(self, layout: u32) -> bool {
        match self {
            SliceType::Opaque => layout >= LAYOUT_V2,
            _ => true,
        }
    }
}

/// File header (64 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    /// Magic bytes: "SRSFORGE"
    pub magic: [u8; 8],
    /// Layout version
    pub layout: u32,
    pub flags: ArtifactFlags,
    /// Number of slices
    pub slice_count: u32,
    /// Number of records across all slices
    pub record_count: u32,
    /// SHA-256 of all bytes after the header
    pub checksum: [u8; 32],
    /// Offset of the slice index (from file start)
    pub index_offset: u32,
}

impl ArtifactHeader {
    pub fn new(layout: u32) -> Self {
        Self {
            magic: MAGIC,
            layout,
            flags: ArtifactFlags::CHECKSUMMED,
            slice_count: 0,
            record_count: 0,
            checksum: [0; 32],
            index_offset: HEADER_SIZE as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.magic);
        out[8..12].copy_from_slice(&self.layout.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[16..20].copy_from_slice(&self.slice_count.to_le_bytes());
        out[20..24].copy_from_slice(&self.record_count.to_le_bytes());
        out[24..56].copy_from_slice(&self.checksum);
        out[56..60].copy_from_slice(&self.index_offset.to_le_bytes());
        // 60..64 reserved
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidHeaderSize {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&data[24..56]);
        Ok(Self {
            magic,
            layout: read_u32(data, 8),
            flags: ArtifactFlags::from_bits_truncate(read_u32(data, 12)),
            slice_count: read_u32(data, 16),
            record_count: read_u32(data, 20),
            checksum,
            index_offset: read_u32(data, 56),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        if !matches!(self.layout, LAYOUT_V1 | LAYOUT_V2) {
            return Err(Error::UnsupportedLayout(self.layout));
        }
        Ok(())
    }
}

/// Slice index entry (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceEntry {
    /// Slice type
    pub slice_type: u8,
    /// Offset to slice data (from file start)
    pub offset: u32,
    /// Size of slice data
    pub size: u32,
    /// Number of entries in this slice
    pub count: u32,
}

impl SliceEntry {
    pub fn new(slice_type: SliceType) -> Self {
        Self {
            slice_type: slice_type as u8,
            offset: 0,
            size: 0,
            count: 0,
        }
    }

    pub fn get_type(&self) -> Option<SliceType> {
        SliceType::from_u8(self.slice_type)
    }

    pub fn to_bytes(&self) -> [u8; SLICE_ENTRY_SIZE] {
        let mut out = [0u8; SLICE_ENTRY_SIZE];
        out[0] = self.slice_type;
        // 1..4 reserved
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            slice_type: data[0],
            offset: read_u32(data, 4),
            size: read_u32(data, 8),
            count: read_u32(data, 12),
        }
    }
}

/// Read a little-endian u32 at `at`. The caller checks bounds.
pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Append a u16-length-prefixed string.
pub(crate) fn put_short_str(out: &mut Vec<u8>, s: &str) -> std::result::Result<(), String> {
    let len = u16::try_from(s.len()).map_err(|_| format!("string too long: {} bytes", s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Append a u32-length-prefixed string.
pub(crate) fn put_long_str(out: &mut Vec<u8>, s: &str) -> std::result::Result<(), String> {
    let len = u32::try_from(s.len()).map_err(|_| format!("string too long: {} bytes", s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Truncated(format!("need {} bytes at offset {}", n, self.pos))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(read_u32(b, 0))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Truncated("string is not UTF-8".to_string()))
    }

    pub fn short_str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.string(len)
    }

    pub fn long_str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.string(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = ArtifactHeader::new(LAYOUT_V2);
        header.slice_count = 3;
        header.record_count = 42;
        header.checksum = [7; 32];
        header.flags |= ArtifactFlags::HAS_OPAQUE;

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..8], b"SRSFORGE");
        assert_eq!(ArtifactHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_validation() {
        let header = ArtifactHeader::new(LAYOUT_V1);
        assert!(header.validate().is_ok());

        let mut bad_magic = header;
        bad_magic.magic = [0; 8];
        assert!(matches!(bad_magic.validate(), Err(Error::InvalidMagic)));

        let mut bad_layout = header;
        bad_layout.layout = 9;
        assert!(matches!(
            bad_layout.validate(),
            Err(Error::UnsupportedLayout(9))
        ));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            ArtifactHeader::from_bytes(&[0u8; 10]),
            Err(Error::InvalidHeaderSize {
                expected: HEADER_SIZE,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_slice_entry_roundtrip() {
        let mut entry = SliceEntry::new(SliceType::CidrV6);
        entry.offset = 128;
        entry.size = 48;
        entry.count = 2;
        let bytes = entry.to_bytes();
        assert_eq!(SliceEntry::from_bytes(&bytes), entry);
        assert_eq!(entry.get_type(), Some(SliceType::CidrV6));
    }

    #[test]
    fn test_slice_type_codes() {
        assert_eq!(SliceType::from_u8(0x01), Some(SliceType::DomainExact));
        assert_eq!(SliceType::from_u8(0x0A), Some(SliceType::Opaque));
        assert_eq!(SliceType::from_u8(0xFF), None);
        assert!(!SliceType::Opaque.supported_by(LAYOUT_V1));
        assert!(SliceType::Opaque.supported_by(LAYOUT_V2));
        assert!(SliceType::Field.supported_by(LAYOUT_V1));
    }

    #[test]
    fn test_cursor_bounds() {
        let mut data = Vec::new();
        put_short_str(&mut data, "port").unwrap();
        data.extend_from_slice(&7i64.to_le_bytes());

        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.short_str().unwrap(), "port");
        assert_eq!(cursor.i64().unwrap(), 7);
        assert!(cursor.is_empty());
        assert!(matches!(cursor.u8(), Err(Error::Truncated(_))));
    }
}
