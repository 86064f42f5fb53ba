// SPDX-License-Identifier: Apache-2.0

//! SR-IOV device management for a Linux host.
//!
//! This crate reconciles live kernel state into value snapshots of physical
//! functions ([`Pf`]) and the virtual functions ([`Vf`]) they expose, tracks
//! which VFs are allocated to processes through VFIO, selects free VFs for
//! callers, and plans/applies declarative sizing policies against
//! `sriov_numvfs`.
//!
//! Everything here is synchronous and stateless between calls: each
//! [`Inventory`] read rebuilds the model from sysfs, and every snapshot may
//! be stale the instant after it is taken. Mutating operations (resizes,
//! driver binds) are fire-and-forget sysfs writes with no verification
//! read-back; a caller wanting confirmation re-runs discovery. Callers must
//! serialize mutations per PF, and VFIO binds per vendor/device pair, since
//! `new_id` is a driver-global file.

#![deny(clippy::unwrap_used)]

pub mod alloc;
pub mod bind;
pub mod ethtool;
pub mod inventory;
mod net;
pub mod pf;
pub mod policy;
pub mod vf;

pub use bind::{BindError, PciDriver};
pub use inventory::{DiscoverError, Inventory};
pub use pf::{Pf, PfConfig};
pub use policy::{
    ApplyError, PfPolicy, PfPolicyOptions, PfSelector, PfSelectorOptions, PlanEntry, PolicyError,
    SelectorKind, Sizing, apply_pf_configs,
};
pub use vf::{Vf, Vfs};
