// SPDX-License-Identifier: Apache-2.0

//! Virtual function snapshots and the free-VF allocator.

use std::collections::BTreeMap;

use pci::Address;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A point-in-time snapshot of a virtual function.
///
/// `pf_address` is a non-owning back-reference to the parent PF, resolved
/// from the device's `physfn` symlink; PF and VF snapshots are independent
/// values, never a live object graph. `allocated` is derived from a VFIO
/// allocation scan and can be stale the instant after it is read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Vf {
    pub pf_address: Address,
    pub hostname: String,
    pub host_id: String,
    pub address: Address,
    pub vendor: String,
    pub vendor_id: String,
    pub device: String,
    pub device_id: String,
    pub mac_address: String,
    pub ip_addresses: Vec<String>,
    pub driver: String,
    pub interface_name: String,
    pub iommu_group: String,
    pub allocated: bool,
}

impl Vf {
    /// Globally unique identity: `host_id:address`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.host_id, self.address)
    }

    /// The bus component of this VF's address.
    #[must_use]
    pub fn bus(&self) -> &str {
        &self.address.bus
    }
}

/// A collection of VF snapshots from one inventory read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vfs(pub Vec<Vf>);

fn vendor_matcher(pattern: &str) -> Option<regex::Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            warn!("invalid vendor pattern {pattern:?}: {err}");
            None
        }
    }
}

impl Vfs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vf> {
        self.0.iter()
    }

    /// The VFs owned by the PF at `pf_address`.
    #[must_use]
    pub fn by_pf_address(&self, pf_address: &Address) -> Vfs {
        Vfs(self
            .0
            .iter()
            .filter(|vf| &vf.pf_address == pf_address)
            .cloned()
            .collect())
    }

    /// The VFs whose vendor name matches any of the given patterns
    /// (case-insensitive regex).
    #[must_use]
    pub fn by_vendors(&self, vendor_patterns: &[String]) -> Vfs {
        let matchers: Vec<_> = vendor_patterns
            .iter()
            .filter_map(|p| vendor_matcher(p))
            .collect();
        Vfs(self
            .0
            .iter()
            .filter(|vf| matchers.iter().any(|re| re.is_match(&vf.vendor)))
            .cloned()
            .collect())
    }

    /// The number of distinct parent PFs across this collection.
    #[must_use]
    pub fn num_pfs(&self) -> usize {
        self.0
            .iter()
            .map(|vf| &vf.pf_address)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    /// Annotate every VF's `allocated` flag from one shared VFIO scan.
    pub fn mark_allocations(&mut self, allocations: &[String]) {
        for vf in &mut self.0 {
            vf.allocated = crate::alloc::is_allocated(allocations, &vf.iommu_group);
        }
    }

    /// Select the next free VF for a vendor, balancing across buses.
    ///
    /// Among VFs whose vendor name matches `vendor_pattern`
    /// (case-insensitive regex), the bus with the fewest allocated matching
    /// VFs that still has a free VF wins; ties break toward the lowest bus
    /// string, and free VFs within a bus are taken in address order.
    /// Returns `None` when nothing matches — being handed out does not mark
    /// the VF allocated; only an actual VFIO claim does.
    #[must_use]
    pub fn next_vf(&self, vendor_pattern: &str) -> Option<&Vf> {
        let re = vendor_matcher(vendor_pattern)?;
        let mut allocated_per_bus: BTreeMap<&str, usize> = BTreeMap::new();
        let mut free_per_bus: BTreeMap<&str, Vec<&Vf>> = BTreeMap::new();
        for vf in &self.0 {
            if !re.is_match(&vf.vendor) {
                continue;
            }
            if vf.allocated {
                *allocated_per_bus.entry(vf.bus()).or_insert(0) += 1;
            } else {
                allocated_per_bus.entry(vf.bus()).or_insert(0);
                free_per_bus.entry(vf.bus()).or_default().push(vf);
            }
        }
        // BTreeMap order makes the tie-break deterministic: among buses with
        // a free VF, lowest allocated count first, then lowest bus string.
        let best_bus = free_per_bus
            .keys()
            .min_by_key(|bus| (allocated_per_bus.get(*bus).copied().unwrap_or(0), **bus))
            .map(|bus| (*bus).to_string())?;
        let mut free = free_per_bus.remove(best_bus.as_str())?;
        free.sort_by(|a, b| a.address.cmp(&b.address));
        free.first().copied()
    }

    /// The first unallocated VF whose parent PF address matches
    /// `pf_pattern` (case-insensitive regex), in address order.
    #[must_use]
    pub fn next_vf_by_pf(&self, pf_pattern: &str) -> Option<&Vf> {
        let re = vendor_matcher(pf_pattern)?;
        let mut candidates: Vec<&Vf> = self
            .0
            .iter()
            .filter(|vf| !vf.allocated && re.is_match(&vf.pf_address.to_string()))
            .collect();
        candidates.sort_by(|a, b| a.address.cmp(&b.address));
        candidates.first().copied()
    }
}

impl IntoIterator for Vfs {
    type Item = Vf;
    type IntoIter = std::vec::IntoIter<Vf>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Vfs {
    type Item = &'a Vf;
    type IntoIter = std::slice::Iter<'a, Vf>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
