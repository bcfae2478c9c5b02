use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;

use kubevip_ipam::{
    builder::{split_cidrs_by_ip_family, split_ranges_by_ip_family},
    config::AllocationConfig,
    error::Error as IpamError,
    ipset::IpSet,
    manager::PoolRegistryInner,
};

use crate::controller::error::Error;
use crate::controller::reconciler::service_watcher::LOADBALANCER_IPS_ANNOTATION;

// Configuration document key bases, resolved as `<base>-<namespace>`
// first, `<base>-global` second.
pub const CONFIG_MAP_CIDR_KEY: &str = "cidr";
pub const CONFIG_MAP_RANGE_KEY: &str = "range";
pub const CONFIG_MAP_ALLOW_SHARE_KEY: &str = "allow-share";
pub const CONFIG_MAP_INTERFACE_KEY: &str = "interface";

// Single-valued configuration document keys.
pub const CONFIG_MAP_SEARCH_ORDER_KEY: &str = "search-order";
pub const CONFIG_MAP_SKIP_END_IPS_KEY: &str = "skip-end-ips-in-cidr";

// Pool sentinel delegating address assignment to DHCP.
pub const DHCP_POOL: &str = "0.0.0.0/32";

const IP_FAMILY_IPV6: &str = "IPv6";
const PREFER_DUAL_STACK: &str = "PreferDualStack";
const REQUIRE_DUAL_STACK: &str = "RequireDualStack";

/// The effective pool for a namespace: the declaration string, whether
/// it came from the global key, and whether IPv4 VIP sharing is allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSelection {
    pub pool: String,
    pub global: bool,
    pub allow_share: bool,
}

fn get_config_with_namespace(cm: &ConfigMap, namespace: &str, name: &str) -> Option<String> {
    cm.data
        .as_ref()
        .and_then(|data| data.get(&format!("{name}-{namespace}")))
        .cloned()
}

/// Resolve a key base against the configuration document: the
/// namespace-scoped key wins over the global key, absence yields None.
pub fn get_config(
    cm: &ConfigMap,
    namespace: &str,
    cm_name: &str,
    name: &str,
) -> Option<(String, bool)> {
    if let Some(value) = get_config_with_namespace(cm, namespace, name) {
        tracing::info!(
            key = format!("{name}-{namespace}"),
            config_map = cm_name,
            "Taking the namespaced value"
        );
        return Some((value, false));
    }
    if let Some(value) = get_config_with_namespace(cm, "global", name) {
        tracing::info!(
            key = format!("{name}-global"),
            config_map = cm_name,
            "Taking the global value"
        );
        return Some((value, true));
    }
    None
}

pub fn discover_pool(
    cm: &ConfigMap,
    namespace: &str,
    cm_name: &str,
) -> Result<PoolSelection, Error> {
    let allow_share = get_config(cm, namespace, cm_name, CONFIG_MAP_ALLOW_SHARE_KEY)
        .map(|(v, _)| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if let Some((cidr, global)) = get_config(cm, namespace, cm_name, CONFIG_MAP_CIDR_KEY) {
        return Ok(PoolSelection {
            pool: cidr,
            global,
            allow_share,
        });
    }

    if let Some((ip_range, global)) = get_config(cm, namespace, cm_name, CONFIG_MAP_RANGE_KEY) {
        return Ok(PoolSelection {
            pool: ip_range,
            global,
            allow_share,
        });
    }

    Err(Error::NoPool)
}

pub fn allocation_config(cm: &ConfigMap) -> AllocationConfig {
    let mut config = AllocationConfig::default();
    if let Some(data) = cm.data.as_ref() {
        if data
            .get(CONFIG_MAP_SEARCH_ORDER_KEY)
            .map(|v| v == "desc")
            .unwrap_or(false)
        {
            config.return_ip_in_desc_order = true;
        }
        if data
            .get(CONFIG_MAP_SKIP_END_IPS_KEY)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            config.skip_end_ips_in_cidr = true;
        }
    }
    config
}

/// The interface advertised for services of a namespace, when any.
pub fn discover_interface(cm: &ConfigMap, namespace: &str) -> Option<String> {
    get_config_with_namespace(cm, namespace, CONFIG_MAP_INTERFACE_KEY)
        .or_else(|| get_config_with_namespace(cm, "global", CONFIG_MAP_INTERFACE_KEY))
}

/// Ports bound on a shared IPv4 address. A service that declares no
/// ports consumes the whole address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortBindings {
    WholeIp,
    Ports(BTreeSet<i32>),
}

fn service_ports(svc: &Service) -> Vec<i32> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default()
}

/// Gather the in-use address set and, when sharing is allowed, the
/// per-IPv4 port bindings of every controller-owned service in scope.
pub fn map_implemented_services(
    svcs: &[Service],
    allow_share: bool,
) -> Result<(IpSet, BTreeMap<Ipv4Addr, PortBindings>), Error> {
    let mut builder = IpSet::builder();
    let mut port_map: BTreeMap<Ipv4Addr, PortBindings> = BTreeMap::new();

    for svc in svcs.iter() {
        let Some(ips) = svc.annotations().get(LOADBALANCER_IPS_ANNOTATION) else {
            continue;
        };
        for part in ips.split(',') {
            let addr = IpAddr::from_str(part)
                .map_err(|_| Error::Ipam(IpamError::InvalidAddress(part.to_string())))?;

            if allow_share {
                if let IpAddr::V4(v4) = addr {
                    let ports = service_ports(svc);
                    if ports.is_empty() {
                        tracing::warn!(
                            name = svc.name_any(),
                            address = v4.to_string(),
                            "Service does not define ports, considering the address non-shareable"
                        );
                        port_map.insert(v4, PortBindings::WholeIp);
                    } else {
                        let bindings = port_map
                            .entry(v4)
                            .or_insert_with(|| PortBindings::Ports(BTreeSet::new()));
                        if let PortBindings::Ports(bound) = bindings {
                            bound.extend(ports);
                        }
                    }
                }
            }

            builder.add(addr);
        }
    }

    Ok((builder.build(), port_map))
}

/// Pick an already bound IPv4 address whose port set does not collide
/// with the candidate service. Addresses are walked in sorted order so
/// the choice is deterministic. Collision is on the integer port value;
/// TCP, UDP and SCTP are treated identically at this layer.
pub fn discover_shared_vip(
    svc: &Service,
    port_map: &BTreeMap<Ipv4Addr, PortBindings>,
) -> Option<Ipv4Addr> {
    let requested: BTreeSet<i32> = service_ports(svc).into_iter().collect();

    for (ip, bindings) in port_map.iter() {
        match bindings {
            PortBindings::WholeIp => continue,
            PortBindings::Ports(bound) => {
                if requested.is_disjoint(bound) {
                    tracing::info!(
                        name = svc.name_any(),
                        address = ip.to_string(),
                        ports = ?requested,
                        bound = ?bound,
                        "Sharing the address between services"
                    );
                    return Some(*ip);
                }
            }
        }
    }

    None
}

/// Allocate one or two VIPs from the declared pool, honoring the IP
/// family policy and ordering of the service. The result is the comma
/// separated value of the loadbalancerIPs annotation.
#[allow(clippy::too_many_arguments)]
pub fn discover_vips(
    registry: &mut PoolRegistryInner,
    namespace: &str,
    pool: &str,
    preferred_v4: Option<Ipv4Addr>,
    in_use: &IpSet,
    config: &AllocationConfig,
    ip_family_policy: Option<&str>,
    ip_families: &[String],
) -> Result<String, Error> {
    // DHCP delegation bypasses the allocator entirely.
    if pool == DHCP_POOL {
        return Ok(Ipv4Addr::UNSPECIFIED.to_string());
    }
    if pool.is_empty() {
        return Err(Error::NoPool);
    }

    let (v4_pool, v6_pool) = if pool.contains('/') {
        split_cidrs_by_ip_family(pool)
    } else {
        split_ranges_by_ip_family(pool)
    }
    .map_err(Error::Ipam)?;

    match ip_family_policy {
        Some(policy) if policy == PREFER_DUAL_STACK || policy == REQUIRE_DUAL_STACK => {
            discover_vips_dual_stack(
                registry,
                namespace,
                &v4_pool,
                &v6_pool,
                preferred_v4,
                in_use,
                config,
                policy,
                ip_families,
            )
        }
        _ => discover_vips_single_stack(
            registry,
            namespace,
            &v4_pool,
            &v6_pool,
            preferred_v4,
            in_use,
            config,
            ip_families,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn discover_vips_single_stack(
    registry: &mut PoolRegistryInner,
    namespace: &str,
    v4_pool: &str,
    v6_pool: &str,
    preferred_v4: Option<Ipv4Addr>,
    in_use: &IpSet,
    config: &AllocationConfig,
    ip_families: &[String],
) -> Result<String, Error> {
    let mut pool = v4_pool;
    if ip_families.is_empty() {
        if pool.is_empty() {
            pool = v6_pool;
        }
    } else if ip_families[0] == IP_FAMILY_IPV6 {
        pool = v6_pool;
    }
    if pool.is_empty() {
        return Err(Error::NoPool);
    }

    // The caller has already proved a preferred address is reusable.
    if pool == v4_pool {
        if let Some(preferred) = preferred_v4 {
            return Ok(preferred.to_string());
        }
    }

    discover_address(registry, namespace, pool, in_use, config)
        .map(|addr| addr.to_string())
        .map_err(Error::Ipam)
}

#[allow(clippy::too_many_arguments)]
fn discover_vips_dual_stack(
    registry: &mut PoolRegistryInner,
    namespace: &str,
    v4_pool: &str,
    v6_pool: &str,
    preferred_v4: Option<Ipv4Addr>,
    in_use: &IpSet,
    config: &AllocationConfig,
    policy: &str,
    ip_families: &[String],
) -> Result<String, Error> {
    if policy == REQUIRE_DUAL_STACK && (v4_pool.is_empty() || v6_pool.is_empty()) {
        return Err(Error::DualStackUnsatisfiable(
            "the configuration does not declare pools for both IPv4 and IPv6".to_string(),
        ));
    }

    let (primary, secondary) = if ip_families
        .first()
        .map(|f| f == IP_FAMILY_IPV6)
        .unwrap_or(false)
    {
        (v6_pool, v4_pool)
    } else {
        (v4_pool, v6_pool)
    };

    let mut vips: Vec<String> = Vec::new();
    let mut primary_err = None;
    let mut secondary_err = None;

    if !primary.is_empty() {
        primary_err = discover_from_pool(
            registry,
            namespace,
            primary,
            preferred_v4,
            v4_pool,
            in_use,
            config,
            &mut vips,
        )?;
    }
    if !secondary.is_empty() {
        secondary_err = discover_from_pool(
            registry,
            namespace,
            secondary,
            preferred_v4,
            v4_pool,
            in_use,
            config,
            &mut vips,
        )?;
    }

    if policy == REQUIRE_DUAL_STACK {
        if primary_err.is_some() || secondary_err.is_some() {
            return Err(Error::DualStackUnsatisfiable(render_errors(&[
                primary_err,
                secondary_err,
            ])));
        }
    } else {
        if primary_err.is_some() && secondary_err.is_some() {
            return Err(Error::DualStackUnsatisfiable(render_errors(&[
                primary_err,
                secondary_err,
            ])));
        }
        if let Some(e) = primary_err.as_ref().or(secondary_err.as_ref()) {
            tracing::warn!(
                namespace,
                error = e.to_string(),
                "PreferDualStack service will be single-stack"
            );
        }
    }

    Ok(vips.join(","))
}

/// Allocate from one per-family pool, collecting exhaustion as a value
/// so the dual-stack policies can branch on it.
#[allow(clippy::too_many_arguments)]
fn discover_from_pool(
    registry: &mut PoolRegistryInner,
    namespace: &str,
    pool: &str,
    preferred_v4: Option<Ipv4Addr>,
    v4_pool: &str,
    in_use: &IpSet,
    config: &AllocationConfig,
    vips: &mut Vec<String>,
) -> Result<Option<IpamError>, Error> {
    if pool == v4_pool {
        if let Some(preferred) = preferred_v4 {
            vips.push(preferred.to_string());
            return Ok(None);
        }
    }
    match discover_address(registry, namespace, pool, in_use, config) {
        Ok(addr) => {
            vips.push(addr.to_string());
            Ok(None)
        }
        Err(e @ IpamError::OutOfIps { .. }) => Ok(Some(e)),
        Err(e) => Err(Error::Ipam(e)),
    }
}

fn discover_address(
    registry: &mut PoolRegistryInner,
    namespace: &str,
    pool: &str,
    in_use: &IpSet,
    config: &AllocationConfig,
) -> Result<IpAddr, IpamError> {
    if pool == DHCP_POOL {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    if pool.contains('/') {
        registry.find_available_host_from_cidr(namespace, pool, in_use, config)
    } else {
        registry.find_available_host_from_range(namespace, pool, in_use, config)
    }
}

fn render_errors(errors: &[Option<IpamError>]) -> String {
    errors
        .iter()
        .flatten()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubevip_ipam::manager::PoolRegistry;
    use rstest::rstest;

    use crate::fixture::reconciler::{
        test_config_map, test_svc_with_allocation, test_svc_with_ports,
    };

    #[rstest(
        data,
        namespace,
        expected,
        case(
            vec![("cidr-global", "192.168.1.1/24")],
            "default",
            Some(PoolSelection { pool: "192.168.1.1/24".to_string(), global: true, allow_share: false }),
        ),
        case(
            vec![("cidr-system", "10.10.10.8/29"), ("cidr-global", "192.168.1.1/24")],
            "system",
            Some(PoolSelection { pool: "10.10.10.8/29".to_string(), global: false, allow_share: false }),
        ),
        case(
            vec![("range-global", "192.168.0.253-192.168.1.2")],
            "default",
            Some(PoolSelection { pool: "192.168.0.253-192.168.1.2".to_string(), global: true, allow_share: false }),
        ),
        case(
            vec![("cidr-global", "10.0.0.0/30"), ("range-default", "192.168.0.10-192.168.0.12")],
            "default",
            Some(PoolSelection { pool: "10.0.0.0/30".to_string(), global: true, allow_share: false }),
        ),
        case(
            vec![("cidr-global", "10.0.0.0/30,2001::0/48"), ("allow-share-global", "true")],
            "default",
            Some(PoolSelection { pool: "10.0.0.0/30,2001::0/48".to_string(), global: true, allow_share: true }),
        ),
        case(
            vec![("allow-share-default", "not-a-bool"), ("cidr-default", "10.0.0.0/30")],
            "default",
            Some(PoolSelection { pool: "10.0.0.0/30".to_string(), global: false, allow_share: false }),
        ),
        case(vec![("interface-global", "ens18")], "default", None),
    )]
    fn works_discover_pool(
        data: Vec<(&str, &str)>,
        namespace: &str,
        expected: Option<PoolSelection>,
    ) {
        let cm = test_config_map(&data);
        let res = discover_pool(&cm, namespace, "kubevip");
        match expected {
            Some(selection) => assert_eq!(res.unwrap(), selection),
            None => assert!(matches!(res, Err(Error::NoPool))),
        }
    }

    #[rstest(
        data,
        desc,
        skip,
        case(vec![], false, false),
        case(vec![("search-order", "desc")], true, false),
        case(vec![("search-order", "asc")], false, false),
        case(vec![("skip-end-ips-in-cidr", "true")], false, true),
        case(vec![("skip-end-ips-in-cidr", "false")], false, false),
        case(vec![("search-order", "desc"), ("skip-end-ips-in-cidr", "true")], true, true),
    )]
    fn works_allocation_config(data: Vec<(&str, &str)>, desc: bool, skip: bool) {
        let config = allocation_config(&test_config_map(&data));
        assert_eq!(config.return_ip_in_desc_order, desc);
        assert_eq!(config.skip_end_ips_in_cidr, skip);
    }

    #[rstest(
        data,
        namespace,
        expected,
        case(vec![("interface-global", "ens18")], "default", Some("ens18")),
        case(
            vec![("interface-default", "ens19"), ("interface-global", "ens18")],
            "default",
            Some("ens19"),
        ),
        case(vec![], "default", None),
    )]
    fn works_discover_interface(data: Vec<(&str, &str)>, namespace: &str, expected: Option<&str>) {
        let cm = test_config_map(&data);
        assert_eq!(
            discover_interface(&cm, namespace),
            expected.map(|s| s.to_string())
        );
    }

    #[test]
    fn works_map_implemented_services() {
        let svcs = vec![
            test_svc_with_allocation("svc-a", "10.0.0.1", &[123, 345]),
            test_svc_with_allocation("svc-b", "10.0.0.2,fe80::10", &[80]),
            test_svc_with_allocation("svc-c", "10.0.0.3", &[]),
        ];
        let (in_use, port_map) = map_implemented_services(&svcs, true).unwrap();

        assert!(in_use.contains(&"10.0.0.1".parse().unwrap()));
        assert!(in_use.contains(&"10.0.0.2".parse().unwrap()));
        assert!(in_use.contains(&"10.0.0.3".parse().unwrap()));
        assert!(in_use.contains(&"fe80::10".parse().unwrap()));

        assert_eq!(
            port_map.get(&"10.0.0.1".parse::<Ipv4Addr>().unwrap()),
            Some(&PortBindings::Ports(BTreeSet::from([123, 345])))
        );
        assert_eq!(
            port_map.get(&"10.0.0.2".parse::<Ipv4Addr>().unwrap()),
            Some(&PortBindings::Ports(BTreeSet::from([80])))
        );
        assert_eq!(
            port_map.get(&"10.0.0.3".parse::<Ipv4Addr>().unwrap()),
            Some(&PortBindings::WholeIp)
        );
        assert!(port_map
            .get(&"10.0.0.4".parse::<Ipv4Addr>().unwrap())
            .is_none());
    }

    #[test]
    fn works_map_implemented_services_without_share() {
        let svcs = vec![test_svc_with_allocation("svc-a", "10.0.0.1", &[123])];
        let (in_use, port_map) = map_implemented_services(&svcs, false).unwrap();
        assert!(in_use.contains(&"10.0.0.1".parse().unwrap()));
        assert!(port_map.is_empty());
    }

    #[test]
    fn fails_map_implemented_services_on_bad_address() {
        let svcs = vec![test_svc_with_allocation("svc-a", "bananas", &[123])];
        let res = map_implemented_services(&svcs, false);
        assert!(res.is_err());
    }

    #[rstest(
        ports,
        expected,
        case(&[8080], Some("10.0.0.1")),
        case(&[80], Some("10.0.0.1")),
        case(&[123], None),
        case(&[345, 8080], None),
    )]
    fn works_discover_shared_vip(ports: &[i32], expected: Option<&str>) {
        let bound = vec![test_svc_with_allocation("svc-a", "10.0.0.1", &[123, 345])];
        let (_, port_map) = map_implemented_services(&bound, true).unwrap();
        let svc = test_svc_with_ports("candidate", ports);
        assert_eq!(
            discover_shared_vip(&svc, &port_map),
            expected.map(|s| s.parse().unwrap())
        );
    }

    #[test]
    fn works_discover_shared_vip_skips_whole_ip() {
        let bound = vec![test_svc_with_allocation("svc-a", "10.0.0.1", &[])];
        let (_, port_map) = map_implemented_services(&bound, true).unwrap();
        let svc = test_svc_with_ports("candidate", &[8080]);
        assert_eq!(discover_shared_vip(&svc, &port_map), None);
    }

    fn in_use(addrs: &[&str]) -> IpSet {
        let mut builder = IpSet::builder();
        for a in addrs {
            builder.add(a.parse().unwrap());
        }
        builder.build()
    }

    #[rstest(
        pool,
        used,
        policy,
        families,
        expected,
        case("192.168.1.1/24", &[], None, &[], "192.168.1.1"),
        case("10.10.10.8/29", &["10.10.10.8", "10.10.10.9", "10.10.10.10", "10.10.10.12"], None, &[], "10.10.10.11"),
        case("192.168.0.253-192.168.1.2", &["192.168.0.253", "192.168.0.254"], None, &[], "192.168.1.1"),
        case("0.0.0.0/32", &[], None, &[], "0.0.0.0"),
        case(
            "10.120.120.1/24,fe80::10/126",
            &[],
            Some("RequireDualStack"),
            &["IPv6", "IPv4"],
            "fe80::10,10.120.120.1"
        ),
        case(
            "10.120.120.1/24,fe80::10/126",
            &[],
            Some("RequireDualStack"),
            &["IPv4", "IPv6"],
            "10.120.120.1,fe80::10"
        ),
        case(
            "10.120.120.1/24,fe80::10/126",
            &[],
            Some("PreferDualStack"),
            &[],
            "10.120.120.1,fe80::10"
        ),
        case("fe80::10/126", &[], None, &["IPv6"], "fe80::10"),
        case("fe80::10/126", &[], None, &[], "fe80::10"),
    )]
    fn works_discover_vips(
        pool: &str,
        used: &[&str],
        policy: Option<&str>,
        families: &[&str],
        expected: &str,
    ) {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let families: Vec<String> = families.iter().map(|f| f.to_string()).collect();
        let res = discover_vips(
            &mut inner,
            "default",
            pool,
            None,
            &in_use(used),
            &AllocationConfig::default(),
            policy,
            &families,
        )
        .unwrap();
        assert_eq!(res, expected);
    }

    #[test]
    fn works_discover_vips_with_preferred_address() {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let res = discover_vips(
            &mut inner,
            "default",
            "10.0.0.0/30,2001::0/48",
            Some("10.0.0.1".parse().unwrap()),
            &in_use(&["10.0.0.1"]),
            &AllocationConfig::default(),
            None,
            &[],
        )
        .unwrap();
        assert_eq!(res, "10.0.0.1");
    }

    #[test]
    fn fails_discover_vips_require_dual_stack_without_v6_pool() {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let res = discover_vips(
            &mut inner,
            "default",
            "10.0.0.0/30",
            None,
            &in_use(&[]),
            &AllocationConfig::default(),
            Some("RequireDualStack"),
            &[],
        );
        assert!(matches!(res, Err(Error::DualStackUnsatisfiable(_))));
    }

    #[test]
    fn fails_discover_vips_require_dual_stack_on_exhaustion() {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let res = discover_vips(
            &mut inner,
            "default",
            "10.0.0.1/32,fe80::10/127",
            None,
            &in_use(&["10.0.0.1"]),
            &AllocationConfig::default(),
            Some("RequireDualStack"),
            &[],
        );
        assert!(matches!(res, Err(Error::DualStackUnsatisfiable(_))));
    }

    #[test]
    fn works_discover_vips_prefer_dual_stack_downgrades() {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let res = discover_vips(
            &mut inner,
            "default",
            "10.0.0.1/32,fe80::10/127",
            None,
            &in_use(&["10.0.0.1"]),
            &AllocationConfig::default(),
            Some("PreferDualStack"),
            &[],
        )
        .unwrap();
        assert_eq!(res, "fe80::10");
    }

    #[test]
    fn fails_discover_vips_single_stack_family_without_pool() {
        let registry = PoolRegistry::new();
        let mut inner = registry.inner.lock().unwrap();
        let res = discover_vips(
            &mut inner,
            "default",
            "10.0.0.0/30",
            None,
            &in_use(&[]),
            &AllocationConfig::default(),
            None,
            &["IPv6".to_string()],
        );
        assert!(matches!(res, Err(Error::NoPool)));
    }
}
