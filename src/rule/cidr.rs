//! IP CIDR block record.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::IpAddr;

/// A CIDR block: network address plus prefix length.
///
/// The address family is implied by the address. Blocks built with a valid
/// prefix have their host bits cleared, so `10.1.2.3/8` and `10.0.0.0/8`
/// compare equal. An out-of-range prefix is kept as written and rejected
/// later by [`CidrBlock::validate`].
///
/// # Examples
/// ```
/// use srsforge::rule::CidrBlock;
///
/// let block = CidrBlock::parse("10.1.2.3/8").unwrap();
/// assert_eq!(block.to_string(), "10.0.0.0/8");
/// assert!(block.contains(&CidrBlock::parse("10.1.0.0/16").unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CidrBlock {
    addr: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Create a block, clearing host bits when the prefix is in range.
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let addr = match IpNet::new(addr, prefix) {
            Ok(net) => net.trunc().addr(),
            Err(_) => addr,
        };
        Self { addr, prefix }
    }

    /// Parse `addr/prefix` or a bare address (host route).
    ///
    /// Only the syntax is checked here; the prefix range is not.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.trim().parse().ok()?;
                let prefix: u8 = prefix.trim().parse().ok()?;
                Some(Self::new(addr, prefix))
            }
            None => {
                let addr: IpAddr = s.parse().ok()?;
                Some(Self::new(addr, max_prefix(&addr)))
            }
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Check the prefix length against the address family.
    pub fn validate(&self) -> Result<(), String> {
        let max = max_prefix(&self.addr);
        if self.prefix > max {
            return Err(format!(
                "prefix length {} out of range for {} (max {})",
                self.prefix,
                if self.is_ipv4() { "IPv4" } else { "IPv6" },
                max
            ));
        }
        Ok(())
    }

    /// Convert to an `ipnet` network, `None` for an out-of-range prefix.
    pub fn to_ipnet(&self) -> Option<IpNet> {
        match self.addr {
            IpAddr::V4(v4) => Ipv4Net::new(v4, self.prefix).ok().map(IpNet::V4),
            IpAddr::V6(v6) => Ipv6Net::new(v6, self.prefix).ok().map(IpNet::V6),
        }
    }

    /// First and last address of the block as integers.
    ///
    /// IPv4 blocks use the low 32 bits; only compare ranges of one family.
    pub fn range(&self) -> (u128, u128) {
        let (start, bits) = match self.addr {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)), 32u32),
            IpAddr::V6(v6) => (u128::from(v6), 128u32),
        };
        let host_bits = bits.saturating_sub(u32::from(self.prefix));
        let span = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        (start, start.saturating_add(span))
    }

    /// Whether `other` lies entirely inside this block (same family only).
    pub fn contains(&self, other: &CidrBlock) -> bool {
        if self.is_ipv4() != other.is_ipv4() {
            return false;
        }
        let (start, end) = self.range();
        let (other_start, other_end) = other.range();
        start <= other_start && other_end <= end
    }

    /// Whether the address falls inside this block.
    pub fn contains_addr(&self, ip: IpAddr) -> bool {
        self.to_ipnet().map_or(false, |net| net.contains(&ip))
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
