// SPDX-License-Identifier: Apache-2.0

//! Network identity of kernel interfaces.
//!
//! MAC and IP addresses come from the kernel's interface enumeration
//! (netlink-backed); bond membership and subinterface presence come from
//! the interface's own sysfs directory, which carries `bonding_slave/` and
//! `upper_*` entries for exactly those associations.

use std::path::Path;

use sysfs::SysRoot;

/// MAC and IP addresses of one interface, as display strings
/// (`aa:bb:cc:dd:ee:ff`, `addr/prefix`).
#[derive(Debug, Default, Clone)]
pub(crate) struct LinkIdentity {
    pub mac_address: String,
    pub ip_addresses: Vec<String>,
}

/// Look up an interface's addresses by name. `None` when the kernel does
/// not know the interface (it may have vanished since the sysfs walk, or
/// the walk may be running against a fixture tree).
pub(crate) fn link_identity(interface_name: &str) -> Option<LinkIdentity> {
    let interface = netdev::get_interfaces()
        .into_iter()
        .find(|interface| interface.name == interface_name)?;
    let mut ip_addresses: Vec<String> = Vec::new();
    for net in &interface.ipv4 {
        ip_addresses.push(net.to_string());
    }
    for net in &interface.ipv6 {
        ip_addresses.push(net.to_string());
    }
    Some(LinkIdentity {
        mac_address: interface
            .mac_addr
            .map(|mac| mac.to_string())
            .unwrap_or_default(),
        ip_addresses,
    })
}

/// The bond aggregator id when the interface is a bonding slave, 0
/// otherwise. Best-effort.
pub(crate) fn bond_member(sys: &SysRoot, interface_name: &str) -> u16 {
    let path = sys.join(format!(
        "class/net/{interface_name}/bonding_slave/ad_aggregator_id"
    ));
    sysfs::read_u32(&path)
        .ok()
        .and_then(|id| u16::try_from(id).ok())
        .unwrap_or(0)
}

/// Whether any link stacks on this interface (dot1q, macvlan, ...), judged
/// by the presence of `upper_*` entries. Best-effort.
pub(crate) fn has_subinterfaces(sys: &SysRoot, interface_name: &str) -> bool {
    let dir = sys.join(format!("class/net/{interface_name}"));
    dir_has_upper_links(&dir)
}

fn dir_has_upper_links(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with("upper_"))
    })
}
