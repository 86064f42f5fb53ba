// SPDX-License-Identifier: Apache-2.0

//! Driver bind and SR-IOV sizing primitives.
//!
//! All of these are fire-and-forget sysfs writes: the kernel accepts or
//! rejects the write, and the caller re-reads the inventory afterwards to
//! observe the result. None of them wait for the device to settle.

use pci::Address;
use strum::{EnumString, IntoStaticStr};
use sysfs::{SysRoot, SysfsError};
use tracing::{debug, info};

use crate::vf::Vf;

/// Drivers this crate binds devices to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, IntoStaticStr)]
pub enum PciDriver {
    #[strum(serialize = "vfio-pci")]
    VfioPci,
    #[strum(serialize = "iavf")]
    Iavf,
}

impl PciDriver {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Errors from bind and sizing writes.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Sysfs(#[from] SysfsError),
    /// A `"0x…"` vendor or device ID that does not parse as hex. The IDs
    /// come from sysfs reads, so this indicates a snapshot taken on a
    /// system this crate does not understand.
    #[error("malformed device id {id:?}")]
    MalformedId { id: String },
}

/// Set the VF count of the PF at `address` by writing `sriov_numvfs`.
///
/// Drivers reject transitions between two nonzero counts, so resizes go
/// through zero; that sequencing is the policy engine's job, not this
/// function's.
///
/// # Errors
///
/// [`SysfsError`] when the write is rejected.
pub fn set_num_vfs(sys: &SysRoot, address: &Address, num_vfs: u32) -> Result<(), SysfsError> {
    info!("setting sriov_numvfs of {address} to {num_vfs}");
    sysfs::write_attr(
        sys.join(format!("bus/pci/devices/{address}/sriov_numvfs")),
        num_vfs.to_string().as_bytes(),
    )
}

/// Unbind the device at `address` from whatever driver currently holds it.
///
/// # Errors
///
/// [`SysfsError`] when the write is rejected, including when no driver is
/// bound (the `driver/` link does not exist).
pub fn unbind_driver(sys: &SysRoot, address: &Address) -> Result<(), SysfsError> {
    info!("unbinding {address} from its driver");
    sysfs::write_attr(
        sys.join(format!("bus/pci/devices/{address}/driver/unbind")),
        address.to_string().as_bytes(),
    )
}

/// Register a `(vendor, device)` ID pair with vfio-pci's `new_id` table.
/// vfio-pci then claims every unbound device carrying that pair.
///
/// `new_id` wants bare hex without the `0x` prefix, e.g. `"8086 154c"`,
/// and is a driver-global file: concurrent callers must serialize
/// registrations per pair. Re-registering a known pair is rejected by the
/// kernel with `EEXIST`.
///
/// # Errors
///
/// [`BindError::MalformedId`] when the IDs do not parse; [`SysfsError`]
/// when the write is rejected.
pub fn register_vfio_id(sys: &SysRoot, vendor_id: &str, device_id: &str) -> Result<(), BindError> {
    let id = format!("{:x} {:x}", parse_id(vendor_id)?, parse_id(device_id)?);
    info!("registering {id:?} with vfio-pci");
    sysfs::write_attr(sys.join("bus/pci/drivers/vfio-pci/new_id"), id.as_bytes())?;
    Ok(())
}

/// Hand one VF to vfio-pci: unbind it from its current driver, then
/// register its ID pair so vfio-pci claims it.
///
/// The unbind is best-effort since a VF fresh out of a resize may have no
/// driver to unbind from.
///
/// # Errors
///
/// Same as [`register_vfio_id`].
pub fn bind_vfio(sys: &SysRoot, vf: &Vf) -> Result<(), BindError> {
    if let Err(err) = unbind_driver(sys, &vf.address) {
        debug!("unbind of {} skipped: {err}", vf.address);
    }
    register_vfio_id(sys, &vf.vendor_id, &vf.device_id)
}

/// Return the device at `address` to a host kernel driver: unbind
/// (best-effort, it may already be unbound), then write the address to the
/// driver's `bind` attribute.
///
/// # Errors
///
/// [`SysfsError`] when the bind write is rejected.
pub fn bind_host_driver(
    sys: &SysRoot,
    address: &Address,
    driver: PciDriver,
) -> Result<(), SysfsError> {
    if let Err(err) = unbind_driver(sys, address) {
        debug!("unbind of {address} skipped: {err}");
    }
    info!("binding {address} to {}", driver.as_str());
    sysfs::write_attr(
        sys.join(format!("bus/pci/drivers/{}/bind", driver.as_str())),
        address.to_string().as_bytes(),
    )
}

fn parse_id(id: &str) -> Result<u32, BindError> {
    id.strip_prefix("0x")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| BindError::MalformedId { id: id.to_string() })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::str::FromStr;

    use super::*;

    fn fixture() -> (tempfile::TempDir, SysRoot) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sys = SysRoot::at(dir.path().join("sys"));
        (dir, sys)
    }

    fn touch(path: PathBuf) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        std::fs::write(path, "").expect("touch");
    }

    #[test]
    fn driver_names_round_trip() {
        assert_eq!(PciDriver::VfioPci.as_str(), "vfio-pci");
        assert_eq!(PciDriver::from_str("vfio-pci"), Ok(PciDriver::VfioPci));
        assert_eq!(PciDriver::from_str("iavf"), Ok(PciDriver::Iavf));
        assert!(PciDriver::from_str("e1000e").is_err());
    }

    #[test]
    fn set_num_vfs_writes_the_count() {
        let (_dir, sys) = fixture();
        let attr = sys.join("bus/pci/devices/0000:03:00.0/sriov_numvfs");
        touch(attr.clone());
        set_num_vfs(&sys, &Address::parse("0000:03:00.0"), 4).unwrap();
        assert_eq!(std::fs::read_to_string(attr).unwrap(), "4");
    }

    #[test]
    fn set_num_vfs_never_creates_the_attribute() {
        let (_dir, sys) = fixture();
        assert!(set_num_vfs(&sys, &Address::parse("0000:03:00.0"), 4).is_err());
    }

    #[test]
    fn unbind_writes_the_address_to_the_driver() {
        let (_dir, sys) = fixture();
        let attr = sys.join("bus/pci/devices/0000:03:00.1/driver/unbind");
        touch(attr.clone());
        unbind_driver(&sys, &Address::parse("0000:03:00.1")).unwrap();
        assert_eq!(std::fs::read_to_string(attr).unwrap(), "0000:03:00.1");
    }

    #[test]
    fn bind_vfio_registers_bare_hex_ids() {
        let (_dir, sys) = fixture();
        let attr = sys.join("bus/pci/drivers/vfio-pci/new_id");
        touch(attr.clone());
        let vf = Vf {
            address: Address::parse("0000:03:00.1"),
            vendor_id: "0x8086".to_string(),
            device_id: "0x154C".to_string(),
            ..Vf::default()
        };
        bind_vfio(&sys, &vf).unwrap();
        assert_eq!(std::fs::read_to_string(attr).unwrap(), "8086 154c");
    }

    #[test]
    fn bind_vfio_rejects_malformed_ids() {
        let (_dir, sys) = fixture();
        touch(sys.join("bus/pci/drivers/vfio-pci/new_id"));
        let vf = Vf {
            vendor_id: "8086".to_string(),
            device_id: "0x154c".to_string(),
            ..Vf::default()
        };
        assert!(matches!(
            bind_vfio(&sys, &vf),
            Err(BindError::MalformedId { id }) if id == "8086"
        ));
    }

    #[test]
    fn bind_host_driver_writes_to_the_named_driver() {
        let (_dir, sys) = fixture();
        let attr = sys.join("bus/pci/drivers/iavf/bind");
        touch(attr.clone());
        bind_host_driver(&sys, &Address::parse("0000:03:00.1"), PciDriver::Iavf).unwrap();
        assert_eq!(std::fs::read_to_string(attr).unwrap(), "0000:03:00.1");
    }
}
