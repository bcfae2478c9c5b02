use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use super::error::Error;

// https://github.com/rust-lang/rust/issues/113744
// Ipv{4/6}Addr cannot be converted to bits directly on stable, so widen
// through the integer representations. IPv4 occupies the low 32 bits.
pub fn addr_to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

pub fn next_addr(addr: &IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(a) => u32::from(*a)
            .checked_add(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(a) => u128::from(*a)
            .checked_add(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

pub fn prev_addr(addr: &IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(a) => u32::from(*a)
            .checked_sub(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(a) => u128::from(*a)
            .checked_sub(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

/// Inclusive address range over a single family with `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    from: IpAddr,
    to: IpAddr,
}

impl AddrRange {
    pub fn new(from: IpAddr, to: IpAddr) -> Result<AddrRange, Error> {
        if from.is_ipv4() != to.is_ipv4() {
            return Err(Error::MixedRangeFamily(format!("{from}-{to}")));
        }
        if addr_to_bits(&from) > addr_to_bits(&to) {
            return Err(Error::InvalidRange(format!("{from}-{to}")));
        }
        Ok(AddrRange { from, to })
    }

    pub fn from_prefix(prefix: &IpNet) -> AddrRange {
        match prefix {
            IpNet::V4(p) => AddrRange {
                from: IpAddr::V4(p.network()),
                to: IpAddr::V4(p.broadcast()),
            },
            IpNet::V6(p) => AddrRange {
                from: IpAddr::V6(p.network()),
                to: IpAddr::V6(p.broadcast()),
            },
        }
    }

    pub fn from(&self) -> &IpAddr {
        &self.from
    }

    pub fn to(&self) -> &IpAddr {
        &self.to
    }

    pub fn is_ipv4(&self) -> bool {
        self.from.is_ipv4()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        addr.is_ipv4() == self.from.is_ipv4()
            && addr_to_bits(&self.from) <= addr_to_bits(addr)
            && addr_to_bits(addr) <= addr_to_bits(&self.to)
    }
}

/// Canonical address set: ranges are sorted, disjoint and merged, with
/// IPv4 ranges ordered before IPv6 ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    ranges: Vec<AddrRange>,
}

impl IpSet {
    pub fn builder() -> IpSetBuilder {
        IpSetBuilder::default()
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    pub fn split_by_family(&self) -> (IpSet, IpSet) {
        let (v4, v6): (Vec<AddrRange>, Vec<AddrRange>) =
            self.ranges.iter().partition(|r| r.is_ipv4());
        (IpSet { ranges: v4 }, IpSet { ranges: v6 })
    }
}

#[derive(Debug, Default)]
pub struct IpSetBuilder {
    ranges: Vec<AddrRange>,
}

impl IpSetBuilder {
    pub fn add(&mut self, addr: IpAddr) {
        self.ranges.push(AddrRange {
            from: addr,
            to: addr,
        });
    }

    pub fn add_range(&mut self, range: AddrRange) {
        self.ranges.push(range);
    }

    pub fn add_prefix(&mut self, prefix: &IpNet) {
        self.ranges.push(AddrRange::from_prefix(prefix));
    }

    pub fn build(mut self) -> IpSet {
        self.ranges.sort_by_key(|r| {
            (
                !r.is_ipv4(),
                addr_to_bits(&r.from),
                addr_to_bits(&r.to),
            )
        });
        let mut merged: Vec<AddrRange> = Vec::new();
        for range in self.ranges.into_iter() {
            match merged.last_mut() {
                // Overlapping or directly adjacent ranges collapse.
                Some(last)
                    if last.is_ipv4() == range.is_ipv4()
                        && addr_to_bits(&range.from)
                            <= addr_to_bits(&last.to).saturating_add(1) =>
                {
                    if addr_to_bits(&range.to) > addr_to_bits(&last.to) {
                        last.to = range.to;
                    }
                }
                _ => merged.push(range),
            }
        }
        IpSet { ranges: merged }
    }
}
