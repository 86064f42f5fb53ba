// SPDX-License-Identifier: Apache-2.0

//! PF/VF inventory built from live kernel state.
//!
//! Every read walks `<sys>/bus/pci/devices`, classifies each entry and
//! enriches the Ethernet PFs/VFs with driver, network and SR-IOV capacity
//! metadata. Nothing is cached: two consecutive reads may disagree, and
//! that is the contract — callers re-read after every mutation.
//!
//! Failure policy, in order of severity: a device that does not satisfy the
//! Ethernet+PF/VF predicate is skipped silently (not-applicable); a device
//! attribute that vanishes mid-scan degrades to an empty field
//! (hot-unplug races must not abort a scan); a violated structural
//! assumption — a device `net/` directory with more than one entry — aborts
//! the whole call, because that is a broken model, not a race.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pci::{Address, ETHERNET_CLASSES, VendorTable};
use sysfs::{SysRoot, SysfsError};
use tracing::debug;

use crate::ethtool::EthtoolSocket;
use crate::net;
use crate::pf::Pf;
use crate::vf::{Vf, Vfs};

/// Errors from inventory reads.
#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error(transparent)]
    Sysfs(#[from] SysfsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A device's `net/` directory held more than one interface. One PCI
    /// function maps to at most one netdev; anything else means the sysfs
    /// layout is not what this crate was built against.
    #[error("more than one network device for {address}")]
    AmbiguousNetDevice { address: String },
}

/// Handle for inventory reads: the sysfs and proc roots plus the
/// vendor/device name table.
///
/// The roots are injectable so the same walk runs against the live system,
/// a fixture tree, or a snapshot shipped from another host.
#[derive(Debug, Clone)]
pub struct Inventory {
    sys: SysRoot,
    proc_root: PathBuf,
    machine_id_path: PathBuf,
    vendors: VendorTable,
}

impl Inventory {
    /// An inventory over the live system: the verified sysfs mount,
    /// `/proc`, and `/etc/machine-id`.
    ///
    /// # Errors
    ///
    /// [`SysfsError`] when sysfs cannot be located or verified.
    pub fn from_system(vendors: VendorTable) -> Result<Inventory, DiscoverError> {
        Ok(Inventory {
            sys: SysRoot::discover()?,
            proc_root: PathBuf::from("/proc"),
            machine_id_path: PathBuf::from("/etc/machine-id"),
            vendors,
        })
    }

    /// An inventory over explicit roots. Used by tests and by callers
    /// operating on snapshot trees.
    pub fn with_roots(
        sys: SysRoot,
        proc_root: impl Into<PathBuf>,
        machine_id_path: impl Into<PathBuf>,
        vendors: VendorTable,
    ) -> Inventory {
        Inventory {
            sys,
            proc_root: proc_root.into(),
            machine_id_path: machine_id_path.into(),
            vendors,
        }
    }

    /// The sysfs root this inventory reads (and the policy engine writes).
    #[must_use]
    pub fn sys(&self) -> &SysRoot {
        &self.sys
    }

    fn device_path(&self, address: &str) -> PathBuf {
        self.sys.join(format!("bus/pci/devices/{address}"))
    }

    /// Whether the PCI device's class marks it as a network controller.
    /// Best-effort: unreadable means "no".
    #[must_use]
    pub fn is_ethernet(&self, address: &str) -> bool {
        match sysfs::read_trimmed(self.device_path(address).join("class")) {
            Ok(class) => ETHERNET_CLASSES.contains(&class.as_str()),
            Err(_) => false,
        }
    }

    /// A physical function has no `physfn` link. Best-effort.
    #[must_use]
    pub fn is_pf(&self, address: &str) -> bool {
        !self.device_path(address).join("physfn").exists()
    }

    /// A virtual function is exactly a non-PF.
    #[must_use]
    pub fn is_vf(&self, address: &str) -> bool {
        !self.is_pf(address)
    }

    /// Stable host identity from the machine-id file.
    ///
    /// # Errors
    ///
    /// [`SysfsError`] when the machine-id file is unreadable.
    pub fn host_id(&self) -> Result<String, DiscoverError> {
        Ok(sysfs::read_trimmed(&self.machine_id_path)?)
    }

    /// The kernel hostname; empty when unavailable.
    #[must_use]
    pub fn hostname(&self) -> String {
        nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Every Ethernet VF on the host, with allocations annotated from one
    /// shared VFIO scan.
    ///
    /// # Errors
    ///
    /// Propagates device-walk failures and structural errors; a device that
    /// fails the VF predicate is skipped, not reported.
    pub fn list_vfs(&self) -> Result<Vfs, DiscoverError> {
        let hostname = self.hostname();
        let host_id = self.host_id()?;
        let mut vfs = Vfs::default();
        for address in self.device_addresses()? {
            let Some(mut vf) = self.vf(&address)? else {
                continue;
            };
            vf.hostname = hostname.clone();
            vf.host_id = host_id.clone();
            vfs.0.push(vf);
        }
        let allocations = crate::alloc::vfio_allocations(&self.proc_root)?;
        vfs.mark_allocations(&allocations);
        Ok(vfs)
    }

    /// Every Ethernet PF on the host, each owning its VF snapshots.
    ///
    /// # Errors
    ///
    /// Propagates device-walk failures and structural errors.
    pub fn list_pfs(&self) -> Result<Vec<Pf>, DiscoverError> {
        let vfs = self.list_vfs()?;
        let hostname = self.hostname();
        let host_id = self.host_id()?;
        let mut pfs = Vec::new();
        for address in self.device_addresses()? {
            let Some(mut pf) = self.pf(&address)? else {
                continue;
            };
            pf.hostname = hostname.clone();
            pf.host_id = host_id.clone();
            pf.vfs = vfs.by_pf_address(&pf.address);
            pfs.push(pf);
        }
        Ok(pfs)
    }

    /// [`Inventory::list_pfs`] indexed by canonical address string.
    ///
    /// # Errors
    ///
    /// Same as [`Inventory::list_pfs`].
    pub fn pfs_map(&self) -> Result<BTreeMap<String, Pf>, DiscoverError> {
        Ok(self
            .list_pfs()?
            .into_iter()
            .map(|pf| (pf.address.to_string(), pf))
            .collect())
    }

    /// The PF at `address`, if that address is an Ethernet PF.
    ///
    /// # Errors
    ///
    /// Same as [`Inventory::list_pfs`].
    pub fn pf_by_address(&self, address: &Address) -> Result<Option<Pf>, DiscoverError> {
        Ok(self
            .list_pfs()?
            .into_iter()
            .find(|pf| &pf.address == address))
    }

    /// Sorted names under `bus/pci/devices`. Sorting keeps walk results
    /// deterministic across runs; the kernel does not order directory
    /// entries.
    fn device_addresses(&self) -> Result<Vec<String>, DiscoverError> {
        let dir = self.sys.join("bus/pci/devices");
        let mut names: Vec<String> = std::fs::read_dir(&dir)?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn pf(&self, address: &str) -> Result<Option<Pf>, DiscoverError> {
        if !(self.is_ethernet(address) && self.is_pf(address)) {
            return Ok(None);
        }
        let mut pf = Pf {
            address: Address::parse(address),
            ..Pf::default()
        };
        if let Some(interface_name) = self.interface_name(address)? {
            pf.interface_name = interface_name;
            if let Some(identity) = net::link_identity(&pf.interface_name) {
                pf.mac_address = identity.mac_address;
                pf.ip_addresses = identity.ip_addresses;
            }
            pf.has_ip_address = !pf.ip_addresses.is_empty();
            pf.bond_member = net::bond_member(&self.sys, &pf.interface_name);
            pf.has_subinterfaces = net::has_subinterfaces(&self.sys, &pf.interface_name);
            self.driver_info(&mut pf);
        }
        (pf.vendor_id, pf.device_id) = self.device_ids(address);
        pf.vendor = self.vendor_name(&pf.vendor_id);
        pf.device = self.device_name(&pf.vendor_id, &pf.device_id);
        (pf.total_vfs, pf.num_vfs) = self.sriov_capacity(address)?;
        Ok(Some(pf))
    }

    fn vf(&self, address: &str) -> Result<Option<Vf>, DiscoverError> {
        if !(self.is_ethernet(address) && self.is_vf(address)) {
            return Ok(None);
        }
        let device = self.device_path(address);
        let mut vf = Vf {
            address: Address::parse(address),
            iommu_group: sysfs::symlink_basename(device.join("iommu_group")).unwrap_or_default(),
            driver: sysfs::symlink_basename(device.join("driver")).unwrap_or_default(),
            ..Vf::default()
        };
        vf.pf_address = sysfs::symlink_basename(device.join("physfn"))
            .map(|target| Address::parse(&target))
            .unwrap_or_default();
        if let Some(interface_name) = self.interface_name(address)? {
            vf.interface_name = interface_name;
            if let Some(identity) = net::link_identity(&vf.interface_name) {
                vf.mac_address = identity.mac_address;
                vf.ip_addresses = identity.ip_addresses;
            }
        }
        (vf.vendor_id, vf.device_id) = self.device_ids(address);
        vf.vendor = self.vendor_name(&vf.vendor_id);
        vf.device = self.device_name(&vf.vendor_id, &vf.device_id);
        Ok(Some(vf))
    }

    /// The sole entry of the device's `net/` directory, when the kernel has
    /// bound a netdev to it.
    ///
    /// # Errors
    ///
    /// [`DiscoverError::AmbiguousNetDevice`] on more than one entry.
    fn interface_name(&self, address: &str) -> Result<Option<String>, DiscoverError> {
        let dir = self.device_path(address).join("net");
        if !dir.exists() {
            return Ok(None);
        }
        let names = net_dir_entries(&dir)?;
        match names.as_slice() {
            [] => Ok(None),
            [name] => Ok(Some(name.clone())),
            _ => Err(DiscoverError::AmbiguousNetDevice {
                address: address.to_string(),
            }),
        }
    }

    /// Raw vendor/device IDs, empty on read failure (hot-unplug race).
    fn device_ids(&self, address: &str) -> (String, String) {
        let device = self.device_path(address);
        (
            sysfs::read_trimmed(device.join("vendor")).unwrap_or_default(),
            sysfs::read_trimmed(device.join("device")).unwrap_or_default(),
        )
    }

    fn vendor_name(&self, vendor_id: &str) -> String {
        if vendor_id.is_empty() {
            return "unknown".to_string();
        }
        self.vendors.vendor_name(vendor_id).to_string()
    }

    fn device_name(&self, vendor_id: &str, device_id: &str) -> String {
        if device_id.is_empty() {
            return "unknown".to_string();
        }
        self.vendors.device_name(vendor_id, device_id).to_string()
    }

    /// `(sriov_totalvfs, sriov_numvfs)`; `(0, 0)` when the PF is not
    /// VF-capable (no `sriov_totalvfs` attribute).
    ///
    /// # Errors
    ///
    /// An existing-but-malformed capacity attribute aborts the call.
    fn sriov_capacity(&self, address: &str) -> Result<(u32, u32), DiscoverError> {
        let device = self.device_path(address);
        let total_path = device.join("sriov_totalvfs");
        if !total_path.exists() {
            return Ok((0, 0));
        }
        let total = sysfs::read_u32(&total_path)?;
        let num = sysfs::read_u32(device.join("sriov_numvfs"))?;
        Ok((total, num))
    }

    /// Driver name/version/firmware via ethtool, best-effort: a PF whose
    /// driver rejects the query still belongs in the inventory.
    fn driver_info(&self, pf: &mut Pf) {
        let info = EthtoolSocket::open().and_then(|sock| sock.drvinfo(&pf.interface_name));
        match info {
            Ok(info) => {
                pf.driver = info.driver;
                pf.driver_version = info.version;
                pf.fw_version = info.fw_version;
            }
            Err(err) => {
                debug!("no driver info for {}: {err}", pf.interface_name);
            }
        }
    }
}

fn net_dir_entries(dir: &Path) -> Result<Vec<String>, DiscoverError> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}
