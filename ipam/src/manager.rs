use std::{
    collections::{hash_map::Entry, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use super::{
    builder::{build_hosts_from_cidr, parse_ranges},
    config::AllocationConfig,
    error::Error,
    ipset::{next_addr, prev_addr, IpSet},
};

/// Process wide cache of parsed pool declarations, keyed by the
/// namespace a service is reconciled in. Strictly a cache over the
/// configuration document: entries are superseded, never mutated, when
/// the declaration string diverges.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pub inner: Arc<Mutex<PoolRegistryInner>>,
}

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        PoolRegistry::default()
    }
}

#[derive(Debug, Default)]
pub struct PoolRegistryInner {
    pools: HashMap<String, PoolEntry>,
}

#[derive(Debug)]
struct PoolEntry {
    declaration: String,
    set: IpSet,
}

impl PoolRegistryInner {
    /// Find a free address in the CIDR declared for `namespace`,
    /// reusing the parsed pool when the declaration is unchanged.
    pub fn find_available_host_from_cidr(
        &mut self,
        namespace: &str,
        cidr: &str,
        in_use: &IpSet,
        config: &AllocationConfig,
    ) -> Result<IpAddr, Error> {
        let entry = self.entry(namespace, cidr, |decl| {
            build_hosts_from_cidr(decl, config.skip_end_ips_in_cidr)
        })?;
        find_free_address(&entry.set, in_use, config).ok_or_else(|| Error::OutOfIps {
            namespace: namespace.to_string(),
            pool: cidr.to_string(),
            is_cidr: true,
        })
    }

    /// Find a free address in the `A-B` range list declared for
    /// `namespace`.
    pub fn find_available_host_from_range(
        &mut self,
        namespace: &str,
        ip_range: &str,
        in_use: &IpSet,
        config: &AllocationConfig,
    ) -> Result<IpAddr, Error> {
        let entry = self.entry(namespace, ip_range, parse_ranges)?;
        find_free_address(&entry.set, in_use, config).ok_or_else(|| Error::OutOfIps {
            namespace: namespace.to_string(),
            pool: ip_range.to_string(),
            is_cidr: false,
        })
    }

    fn entry<F>(
        &mut self,
        namespace: &str,
        declaration: &str,
        build: F,
    ) -> Result<&PoolEntry, Error>
    where
        F: Fn(&str) -> Result<IpSet, Error>,
    {
        match self.pools.entry(namespace.to_string()) {
            Entry::Occupied(o) => {
                let entry = o.into_mut();
                if entry.declaration != declaration {
                    tracing::info!(
                        namespace,
                        from = entry.declaration,
                        to = declaration,
                        "Pool declaration changed, rebuilding the address set"
                    );
                    entry.set = build(declaration)?;
                    entry.declaration = declaration.to_string();
                }
                Ok(entry)
            }
            Entry::Vacant(v) => Ok(v.insert(PoolEntry {
                declaration: declaration.to_string(),
                set: build(declaration)?,
            })),
        }
    }
}

/// Return the first address of the pool that is not in use, walking
/// ascending by default and descending when configured. IPv4 addresses
/// ending in octet 0 or 255 are treated as reserved gateway/broadcast
/// candidates and skipped regardless of prefix length; IPv6 is never
/// filtered this way.
pub fn find_free_address(
    pool: &IpSet,
    in_use: &IpSet,
    config: &AllocationConfig,
) -> Option<IpAddr> {
    if config.return_ip_in_desc_order {
        for range in pool.ranges().iter().rev() {
            let mut addr = *range.to();
            loop {
                if !in_use.contains(&addr) && !is_network_id_or_broadcast(&addr) {
                    return Some(addr);
                }
                if addr == *range.from() {
                    break;
                }
                addr = prev_addr(&addr)?;
            }
        }
    } else {
        for range in pool.ranges().iter() {
            let mut addr = *range.from();
            loop {
                if !in_use.contains(&addr) && !is_network_id_or_broadcast(&addr) {
                    return Some(addr);
                }
                if addr == *range.to() {
                    break;
                }
                addr = next_addr(&addr)?;
            }
        }
    }
    None
}

fn is_network_id_or_broadcast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => {
            let octets = a.octets();
            octets[3] == 0 || octets[3] == 255
        }
        IpAddr::V6(_) => false,
    }
}
