// SPDX-License-Identifier: Apache-2.0

//! PCI addressing and device identity for the SR-IOV manager.
//!
//! This crate is pure and stateless: the address codec and the vendor/device
//! reference table never touch the filesystem.

#![deny(clippy::unwrap_used)]

pub mod address;
pub mod vendor;

pub use address::Address;
pub use vendor::VendorTable;

/// PCI class codes that identify an Ethernet (network controller) function,
/// as read from a device's sysfs `class` attribute.
pub const ETHERNET_CLASSES: &[&str] = &["0x020000"];
