// SPDX-License-Identifier: Apache-2.0

//! Vendor and device name resolution.
//!
//! Maps the raw hex IDs read from a device's sysfs `vendor`/`device`
//! attributes (`"0x1dd8"` style, exactly as the kernel renders them) to
//! human-readable names. The table is an immutable value handed to the
//! inventory builder at construction, so tests can substitute fixtures;
//! IDs absent from the table pass through as the raw hex string rather
//! than producing an error.

use std::collections::BTreeMap;

/// Immutable vendor/device name reference table.
#[derive(Debug, Clone, Default)]
pub struct VendorTable {
    vendors: BTreeMap<String, String>,
    devices: BTreeMap<(String, String), String>,
}

impl VendorTable {
    /// Build a table from `(vendor_id, name)` and
    /// `(vendor_id, device_id, name)` entries.
    pub fn new<V, D>(vendors: V, devices: D) -> VendorTable
    where
        V: IntoIterator<Item = (&'static str, &'static str)>,
        D: IntoIterator<Item = (&'static str, &'static str, &'static str)>,
    {
        VendorTable {
            vendors: vendors
                .into_iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect(),
            devices: devices
                .into_iter()
                .map(|(vendor, device, name)| {
                    ((vendor.to_string(), device.to_string()), name.to_string())
                })
                .collect(),
        }
    }

    /// The Ethernet controllers this manager has been deployed against.
    #[must_use]
    pub fn builtin() -> VendorTable {
        VendorTable::new(
            [
                ("0x1dd8", "pensando"),
                ("0x8086", "intel"),
                ("0x15b3", "mellanox"),
                ("0x14e4", "broadcom"),
            ],
            [
                ("0x1dd8", "0x1000", "DSC Capri Upstream Port"),
                ("0x1dd8", "0x1001", "DSC Virtual Downstream Port"),
                ("0x1dd8", "0x1002", "DSC Ethernet Controller"),
                ("0x1dd8", "0x1003", "DSC Ethernet Controller VF"),
                ("0x1dd8", "0x1004", "DSC Management Controller"),
                ("0x1dd8", "0x1007", "DSC Storage Accelerator"),
                ("0x8086", "0x10ca", "82576 Virtual Function"),
                ("0x8086", "0x1520", "I350 Virtual Function"),
                ("0x8086", "0x1521", "I350 Gigabit Network Connection"),
                ("0x8086", "0x37cd", "x722 Virtual Function"),
                ("0x8086", "0x37d2", "Ethernet Connection x722 for 10GBase-T"),
                ("0x8086", "0x37d0", "Ethernet Connection x722 for SFP"),
                (
                    "0x8086",
                    "0x10fb",
                    "82599ES 10-Gigabit SFI/SFP+ Network Connection",
                ),
                (
                    "0x8086",
                    "0x1572",
                    "Ethernet Controller X710 for 10GbE SFP+",
                ),
                ("0x15b3", "0x1017", "MT27640 Family [ConnectX-5]"),
                ("0x14e4", "0x1682", "NetXtreme BCM57762 Gigabit Ethernet PCIe"),
            ],
        )
    }

    /// The vendor name for a raw vendor ID, or the ID itself when unknown.
    #[must_use]
    pub fn vendor_name<'a>(&'a self, vendor_id: &'a str) -> &'a str {
        self.vendors
            .get(vendor_id)
            .map_or(vendor_id, String::as_str)
    }

    /// The model name for a raw `(vendor, device)` ID pair, or the device ID
    /// itself when unknown.
    #[must_use]
    pub fn device_name<'a>(&'a self, vendor_id: &str, device_id: &'a str) -> &'a str {
        self.devices
            .get(&(vendor_id.to_string(), device_id.to_string()))
            .map_or(device_id, String::as_str)
    }
}
