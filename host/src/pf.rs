// SPDX-License-Identifier: Apache-2.0

//! Physical function snapshots.

use pci::Address;
use serde::{Deserialize, Serialize};

use crate::ethtool::{EthtoolError, EthtoolSocket};
use crate::vf::Vfs;

/// A point-in-time snapshot of an SR-IOV capable Ethernet physical function.
///
/// Constructed fresh on every inventory read and never mutated in place:
/// sysfs writes issued through the policy engine change the kernel state,
/// after which callers re-read. A `Pf` with `total_vfs == 0` is not
/// VF-capable and is left unplanned by sizing policies.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Pf {
    pub hostname: String,
    pub host_id: String,
    pub address: Address,
    pub vendor: String,
    pub vendor_id: String,
    pub device: String,
    pub device_id: String,
    pub has_ip_address: bool,
    /// `addr/prefix` strings, including addresses of subinterfaces.
    pub ip_addresses: Vec<String>,
    pub mac_address: String,
    pub driver: String,
    pub driver_version: String,
    pub fw_version: String,
    pub interface_name: String,
    /// Aggregator id when this PF is a bond slave, 0 otherwise.
    pub bond_member: u16,
    /// Whether any link (dot1q, macvlan, ...) stacks on this interface.
    pub has_subinterfaces: bool,
    pub total_vfs: u32,
    pub num_vfs: u32,
    pub vfs: Vfs,
}

impl Pf {
    /// Globally unique identity: `host_id:address`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.host_id, self.address)
    }

    /// NIC statistics counters by name, queried live over ethtool.
    ///
    /// # Errors
    ///
    /// [`EthtoolError`] when the interface is gone or the driver does not
    /// expose a statistics string set.
    pub fn stats(&self) -> Result<std::collections::BTreeMap<String, u64>, EthtoolError> {
        EthtoolSocket::open()?.stats(&self.interface_name)
    }

    /// Offload feature flags by name (active state), queried live.
    ///
    /// # Errors
    ///
    /// [`EthtoolError`] when the interface is gone or the driver does not
    /// expose a feature string set.
    pub fn features(&self) -> Result<std::collections::BTreeMap<String, bool>, EthtoolError> {
        EthtoolSocket::open()?.features(&self.interface_name)
    }

    /// Live link state: `true` when the link is up.
    ///
    /// # Errors
    ///
    /// [`EthtoolError`] when the interface is gone.
    pub fn link_state(&self) -> Result<bool, EthtoolError> {
        EthtoolSocket::open()?.link_state(&self.interface_name)
    }
}

/// The concrete unit of work derived from a policy plan for one PF: resize
/// to `num_vfs` and, when `vfio` is set, bind the resulting VFs to vfio-pci.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfConfig {
    pub address: Address,
    pub num_vfs: u32,
    pub vfio: bool,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_is_host_id_and_address() {
        let pf = Pf {
            host_id: "c0ffee".to_string(),
            address: Address::parse("0000:03:00.0"),
            ..Pf::default()
        };
        assert_eq!(pf.id(), "c0ffee:0000:03:00.0");
    }

    #[test]
    fn record_field_names_are_stable() {
        let pf = Pf {
            address: Address::parse("0000:03:00.0"),
            total_vfs: 8,
            ..Pf::default()
        };
        let record = serde_yaml_ng::to_string(&pf).unwrap();
        for key in [
            "host_id:",
            "vendor_id:",
            "device_id:",
            "ip_addresses:",
            "mac_address:",
            "fw_version:",
            "interface_name:",
            "bond_member:",
            "has_subinterfaces:",
            "total_vfs:",
            "num_vfs:",
        ] {
            assert!(record.contains(key), "missing {key} in {record}");
        }
    }
}
