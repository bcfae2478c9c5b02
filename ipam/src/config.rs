/// Knobs taken from the configuration document that shape how addresses
/// are picked out of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationConfig {
    /// Walk pools from the highest address down instead of up.
    pub return_ip_in_desc_order: bool,
    /// Drop the network and broadcast address of each declared prefix,
    /// except for /31 and /32.
    pub skip_end_ips_in_cidr: bool,
}
