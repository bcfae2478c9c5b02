use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use super::{
    error::Error,
    ipset::{next_addr, prev_addr, AddrRange, IpSet},
};

/// Parse a comma separated list of CIDR prefixes, possibly mixing
/// families, into a canonical address set covering the whole prefixes.
pub fn parse_cidrs(cidrs: &str) -> Result<IpSet, Error> {
    let mut builder = IpSet::builder();
    for entry in cidrs.split(',') {
        let prefix =
            IpNet::from_str(entry.trim()).map_err(|_| Error::InvalidCidr(entry.to_string()))?;
        builder.add_prefix(&prefix);
    }
    Ok(builder.build())
}

/// Parse a comma separated list of `A-B` entries. Each entry must be a
/// single family and ordered; entries may mix families across the list.
pub fn parse_ranges(ranges: &str) -> Result<IpSet, Error> {
    let mut builder = IpSet::builder();
    for entry in ranges.split(',') {
        let mut parts = entry.trim().splitn(2, '-');
        let (from, to) = match (parts.next(), parts.next()) {
            (Some(f), Some(t)) => (f, t),
            _ => return Err(Error::InvalidRange(entry.to_string())),
        };
        let from = IpAddr::from_str(from).map_err(|_| Error::InvalidRange(entry.to_string()))?;
        let to = IpAddr::from_str(to).map_err(|_| Error::InvalidRange(entry.to_string()))?;
        builder.add_range(AddrRange::new(from, to)?);
    }
    Ok(builder.build())
}

/// Build the allocatable hosts of a comma separated CIDR list.
///
/// IPv4 prefixes keep the single host of a /32 and both hosts of a /31
/// (point-to-point convention); wider prefixes keep the full range unless
/// `skip_end_ips` drops the network and broadcast addresses. IPv6
/// prefixes are always kept whole.
pub fn build_hosts_from_cidr(cidrs: &str, skip_end_ips: bool) -> Result<IpSet, Error> {
    let mut builder = IpSet::builder();
    for entry in cidrs.split(',') {
        let prefix =
            IpNet::from_str(entry.trim()).map_err(|_| Error::InvalidCidr(entry.to_string()))?;
        match prefix {
            IpNet::V4(p) if p.prefix_len() < 31 && skip_end_ips => {
                let range = AddrRange::from_prefix(&prefix);
                let from = next_addr(range.from()).ok_or_else(|| {
                    Error::InvalidCidr(entry.to_string())
                })?;
                let to = prev_addr(range.to()).ok_or_else(|| {
                    Error::InvalidCidr(entry.to_string())
                })?;
                builder.add_range(AddrRange::new(from, to)?);
            }
            _ => builder.add_prefix(&prefix),
        }
    }
    Ok(builder.build())
}

/// Split a comma separated CIDR declaration into per-family declarations.
pub fn split_cidrs_by_ip_family(cidrs: &str) -> Result<(String, String), Error> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for entry in cidrs.split(',') {
        let prefix =
            IpNet::from_str(entry.trim()).map_err(|_| Error::InvalidCidr(entry.to_string()))?;
        match prefix {
            IpNet::V4(_) => v4.push(entry.trim()),
            IpNet::V6(_) => v6.push(entry.trim()),
        }
    }
    Ok((v4.join(","), v6.join(",")))
}

/// Split a comma separated range declaration into per-family declarations.
pub fn split_ranges_by_ip_family(ranges: &str) -> Result<(String, String), Error> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for entry in ranges.split(',') {
        let mut parts = entry.trim().splitn(2, '-');
        let (from, to) = match (parts.next(), parts.next()) {
            (Some(f), Some(t)) => (f, t),
            _ => return Err(Error::InvalidRange(entry.to_string())),
        };
        let from = IpAddr::from_str(from).map_err(|_| Error::InvalidRange(entry.to_string()))?;
        let to = IpAddr::from_str(to).map_err(|_| Error::InvalidRange(entry.to_string()))?;
        if from.is_ipv4() != to.is_ipv4() {
            return Err(Error::MixedRangeFamily(entry.to_string()));
        }
        if from.is_ipv4() {
            v4.push(entry.trim());
        } else {
            v6.push(entry.trim());
        }
    }
    Ok((v4.join(","), v6.join(",")))
}
