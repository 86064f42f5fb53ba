// SPDX-License-Identifier: Apache-2.0

//! PF sizing policy: select, plan, apply.
//!
//! A [`PfPolicy`] pairs a selector (which PFs it governs) with a sizing
//! rule. `plan_*` computes the desired VF count per selected PF without
//! touching the system; `apply` issues the `sriov_numvfs` writes for one
//! host; `apply_concrete` translates the plan into [`PfConfig`]
//! instructions for a remote caller to execute on the host that owns the
//! hardware.
//!
//! Writes are fire-and-forget: success means the kernel accepted the
//! write, not that the device reached the target state. A plan is valid
//! only against the snapshot it was computed from; callers re-plan after
//! every mutation.

use std::collections::{BTreeMap, BTreeSet};

use pci::Address;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sysfs::{SysRoot, SysfsError};
use tracing::{debug, info, warn};

use crate::bind::{self, BindError};
use crate::inventory::{DiscoverError, Inventory};
use crate::pf::{Pf, PfConfig};

/// Errors from policy construction, planning and local apply.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid selector pattern {pattern:?}")]
    InvalidSelector {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    /// `apply`/`apply_concrete` called for a host the policy has not
    /// planned.
    #[error("plan required for host {host_id}")]
    PlanRequired { host_id: String },
    #[error(transparent)]
    Discover(#[from] DiscoverError),
    #[error(transparent)]
    Sysfs(#[from] SysfsError),
}

/// What selects a PF into a policy's scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SelectorKind {
    /// Match the PF's resolved vendor name against a regular expression,
    /// case-insensitively.
    #[serde(rename = "vendor_regexp")]
    VendorRegexp,
}

/// Wire form of a selector, as carried in policy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PfSelectorOptions {
    pub kind: SelectorKind,
    #[serde(rename = "vendor_regexp")]
    pub pattern: String,
}

/// A compiled selector.
#[derive(Clone, Debug)]
pub struct PfSelector {
    kind: SelectorKind,
    pattern: Regex,
}

impl PfSelector {
    /// Compile a selector from its wire form.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidSelector`] when the pattern does not compile.
    pub fn new(options: &PfSelectorOptions) -> Result<PfSelector, PolicyError> {
        let pattern = RegexBuilder::new(&options.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| PolicyError::InvalidSelector {
                pattern: options.pattern.clone(),
                source: Box::new(source),
            })?;
        Ok(PfSelector {
            kind: options.kind,
            pattern,
        })
    }

    /// Whether this selector puts `pf` in scope.
    #[must_use]
    pub fn matches(&self, pf: &Pf) -> bool {
        match self.kind {
            SelectorKind::VendorRegexp => self.pattern.is_match(&pf.vendor),
        }
    }
}

/// Sizing configuration for a policy. `max_vfs` wins over `num_vfs`;
/// `on_reboot` is carried for the orchestrator's benefit and does not
/// change what `apply` does.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PfPolicyOptions {
    #[serde(default)]
    pub on_reboot: bool,
    #[serde(default)]
    pub max_vfs: bool,
    #[serde(default)]
    pub num_vfs: u32,
}

/// The sizing outcome for one PF. `Unchanged` is an explicit "no rule
/// applied" signal, distinct from a resize to the current count.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Sizing {
    Resize { num_vfs: u32 },
    Unchanged,
}

/// One PF's slot in a plan: the snapshot the decision was made against and
/// the decision itself.
#[derive(Clone, Debug)]
pub struct PlanEntry {
    pub current: Pf,
    pub sizing: Sizing,
}

/// A sizing policy with its most recent plan, keyed
/// `host_id → address → entry`.
#[derive(Clone, Debug)]
pub struct PfPolicy {
    selector: PfSelector,
    options: PfPolicyOptions,
    plan: BTreeMap<String, BTreeMap<String, PlanEntry>>,
}

impl PfPolicy {
    /// Build a policy; the selector pattern is compiled here so that
    /// planning itself cannot fail on bad configuration.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidSelector`] from selector compilation.
    pub fn new(
        selector_options: &PfSelectorOptions,
        options: PfPolicyOptions,
    ) -> Result<PfPolicy, PolicyError> {
        Ok(PfPolicy {
            selector: PfSelector::new(selector_options)?,
            options,
            plan: BTreeMap::new(),
        })
    }

    /// Plan against this host's live state.
    ///
    /// # Errors
    ///
    /// [`DiscoverError`] from the inventory read; planning itself cannot
    /// fail.
    pub fn plan_local(&mut self, inventory: &Inventory) -> Result<(), PolicyError> {
        let host_id = inventory.host_id()?;
        let pfs = inventory.list_pfs()?;
        self.plan_hosts([(host_id, pfs)]);
        Ok(())
    }

    /// Plan against caller-supplied host state. Replaces any previous plan
    /// wholesale; a plan is a pure function of the supplied snapshots.
    pub fn plan_hosts(&mut self, hosts: impl IntoIterator<Item = (String, Vec<Pf>)>) {
        self.plan = hosts
            .into_iter()
            .map(|(host_id, pfs)| {
                let entries = pfs
                    .into_iter()
                    .filter(|pf| self.selector.matches(pf))
                    .map(|pf| {
                        let sizing = self.sizing(&pf);
                        (pf.address.to_string(), PlanEntry { current: pf, sizing })
                    })
                    .collect();
                (host_id, entries)
            })
            .collect();
    }

    /// The most recent plan.
    #[must_use]
    pub fn plan(&self) -> &BTreeMap<String, BTreeMap<String, PlanEntry>> {
        &self.plan
    }

    fn sizing(&self, pf: &Pf) -> Sizing {
        if self.options.max_vfs && pf.total_vfs > 0 {
            return Sizing::Resize {
                num_vfs: pf.total_vfs,
            };
        }
        if pf.num_vfs > 0 && self.options.num_vfs > 0 {
            return Sizing::Resize {
                num_vfs: self.options.num_vfs,
            };
        }
        Sizing::Unchanged
    }

    /// Issue the `sriov_numvfs` writes for `host_id`'s planned PFs whose
    /// target differs from the planned-against snapshot. The first write
    /// failure aborts the remaining PFs; PFs already resized stay resized.
    ///
    /// # Errors
    ///
    /// [`PolicyError::PlanRequired`] when no plan covers `host_id`;
    /// otherwise the first rejected write.
    pub fn apply(&self, sys: &SysRoot, host_id: &str) -> Result<(), PolicyError> {
        let entries = self.host_plan(host_id)?;
        for entry in entries.values() {
            let Sizing::Resize { num_vfs } = entry.sizing else {
                continue;
            };
            if num_vfs == entry.current.num_vfs {
                continue;
            }
            bind::set_num_vfs(sys, &entry.current.address, num_vfs)?;
        }
        Ok(())
    }

    /// Translate `host_id`'s plan into [`PfConfig`] instructions, VFIO
    /// bind requested, without any I/O. Unchanged PFs produce no
    /// instruction.
    ///
    /// # Errors
    ///
    /// [`PolicyError::PlanRequired`] when no plan covers `host_id`.
    pub fn apply_concrete(&self, host_id: &str) -> Result<Vec<PfConfig>, PolicyError> {
        let entries = self.host_plan(host_id)?;
        Ok(entries
            .values()
            .filter_map(|entry| match entry.sizing {
                Sizing::Resize { num_vfs } => Some(PfConfig {
                    address: entry.current.address.clone(),
                    num_vfs,
                    vfio: true,
                }),
                Sizing::Unchanged => None,
            })
            .collect())
    }

    fn host_plan(&self, host_id: &str) -> Result<&BTreeMap<String, PlanEntry>, PolicyError> {
        self.plan
            .get(host_id)
            .ok_or_else(|| PolicyError::PlanRequired {
                host_id: host_id.to_string(),
            })
    }
}

/// A per-PF failure from [`apply_pf_configs`].
#[derive(Debug, thiserror::Error)]
#[error("applying config for {address} failed")]
pub struct ApplyError {
    pub address: Address,
    #[source]
    pub source: ApplyFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyFailure {
    #[error(transparent)]
    Sysfs(#[from] SysfsError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Discover(#[from] DiscoverError),
}

/// Execute a batch of [`PfConfig`] instructions, each independently: set
/// the PF's VF count, then, when `vfio` is requested, unbind the resulting
/// VFs and register their vendor/device pairs with vfio-pci. A PF whose
/// resize fails is skipped entirely; failures accumulate so one bad PF
/// cannot block the rest of the batch.
///
/// `new_id` registration is global per driver, so concurrent callers must
/// serialize binds for a given vendor/device pair.
#[must_use]
pub fn apply_pf_configs(inventory: &Inventory, configs: &[PfConfig]) -> Vec<ApplyError> {
    let mut errors = Vec::new();
    for config in configs {
        info!(
            "applying config for {}: num_vfs={} vfio={}",
            config.address, config.num_vfs, config.vfio
        );
        if let Err(err) = bind::set_num_vfs(inventory.sys(), &config.address, config.num_vfs) {
            warn!("resize of {} failed: {err}", config.address);
            errors.push(ApplyError {
                address: config.address.clone(),
                source: err.into(),
            });
            continue;
        }
        if !config.vfio {
            continue;
        }
        if let Err(err) = bind_children_vfio(inventory, &config.address) {
            warn!("vfio bind under {} failed: {err}", config.address);
            errors.push(ApplyError {
                address: config.address.clone(),
                source: err,
            });
        }
    }
    errors
}

/// Re-read the VFs under `pf_address` and hand them to vfio-pci. The
/// re-read is mandatory: the resize just changed the set of children.
fn bind_children_vfio(inventory: &Inventory, pf_address: &Address) -> Result<(), ApplyFailure> {
    let vfs = inventory.list_vfs()?;
    let children = vfs.by_pf_address(pf_address);
    for vf in &children {
        // a VF fresh out of a resize may have no driver yet
        if let Err(err) = bind::unbind_driver(inventory.sys(), &vf.address) {
            debug!("unbind of {} skipped: {err}", vf.address);
        }
    }
    let mut registered = BTreeSet::new();
    for vf in &children {
        if !registered.insert((vf.vendor_id.clone(), vf.device_id.clone())) {
            continue;
        }
        bind::register_vfio_id(inventory.sys(), &vf.vendor_id, &vf.device_id)?;
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;

    fn selector(pattern: &str) -> PfSelectorOptions {
        PfSelectorOptions {
            kind: SelectorKind::VendorRegexp,
            pattern: pattern.to_string(),
        }
    }

    fn pf(address: &str, vendor: &str, total_vfs: u32, num_vfs: u32) -> Pf {
        Pf {
            address: pci::Address::parse(address),
            vendor: vendor.to_string(),
            total_vfs,
            num_vfs,
            ..Pf::default()
        }
    }

    fn planned(policy: &PfPolicy, host_id: &str, address: &str) -> Sizing {
        policy.plan()[host_id][address].sizing
    }

    #[test]
    fn bad_selector_pattern_fails_construction() {
        let err = PfPolicy::new(&selector("(intel"), PfPolicyOptions::default()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSelector { pattern, .. } if pattern == "(intel"));
    }

    #[test]
    fn max_vfs_plans_full_capacity() {
        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([("h1".to_string(), vec![pf("0000:03:00.0", "intel", 8, 2)])]);
        assert_eq!(
            planned(&policy, "h1", "0000:03:00.0"),
            Sizing::Resize { num_vfs: 8 }
        );
    }

    #[test]
    fn configured_count_plans_when_pf_already_sized() {
        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                num_vfs: 4,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([(
            "h1".to_string(),
            vec![
                pf("0000:03:00.0", "intel", 8, 2),
                pf("0000:04:00.0", "intel", 8, 0),
            ],
        )]);
        assert_eq!(
            planned(&policy, "h1", "0000:03:00.0"),
            Sizing::Resize { num_vfs: 4 }
        );
        // an unsized PF matches no rule
        assert_eq!(planned(&policy, "h1", "0000:04:00.0"), Sizing::Unchanged);
    }

    #[test]
    fn incapable_pf_is_left_unchanged() {
        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([("h1".to_string(), vec![pf("0000:05:00.0", "intel", 0, 0)])]);
        assert_eq!(planned(&policy, "h1", "0000:05:00.0"), Sizing::Unchanged);
    }

    #[test]
    fn selector_is_case_insensitive_and_scopes_the_plan() {
        let mut policy = PfPolicy::new(
            &selector("^Intel$"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([(
            "h1".to_string(),
            vec![
                pf("0000:03:00.0", "intel", 8, 2),
                pf("0000:06:00.0", "mellanox", 8, 2),
            ],
        )]);
        let entries = &policy.plan()["h1"];
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("0000:03:00.0"));
    }

    #[test]
    fn replanning_replaces_the_previous_plan() {
        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([("h1".to_string(), vec![pf("0000:03:00.0", "intel", 8, 2)])]);
        policy.plan_hosts([("h2".to_string(), vec![pf("0000:04:00.0", "intel", 8, 2)])]);
        assert!(!policy.plan().contains_key("h1"));
        assert!(policy.plan().contains_key("h2"));
    }

    #[test]
    fn apply_without_a_plan_is_rejected() {
        let policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sys = SysRoot::at(dir.path().join("sys"));
        assert!(matches!(
            policy.apply(&sys, "h1"),
            Err(PolicyError::PlanRequired { host_id }) if host_id == "h1"
        ));
        assert!(matches!(
            policy.apply_concrete("h1"),
            Err(PolicyError::PlanRequired { .. })
        ));
    }

    #[test]
    fn apply_writes_only_pfs_that_need_resizing() {
        let dir = tempfile::tempdir().unwrap();
        let sys = SysRoot::at(dir.path().join("sys"));
        let resized = sys.join("bus/pci/devices/0000:03:00.0/sriov_numvfs");
        let untouched = sys.join("bus/pci/devices/0000:04:00.0/sriov_numvfs");
        for attr in [&resized, &untouched] {
            std::fs::create_dir_all(attr.parent().unwrap()).unwrap();
            std::fs::write(attr, "8\n").unwrap();
        }

        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([(
            "h1".to_string(),
            vec![
                pf("0000:03:00.0", "intel", 8, 2),
                pf("0000:04:00.0", "intel", 8, 8),
            ],
        )]);
        policy.apply(&sys, "h1").unwrap();
        assert_eq!(std::fs::read_to_string(&resized).unwrap(), "8");
        // already at target, left alone
        assert_eq!(std::fs::read_to_string(&untouched).unwrap(), "8\n");
    }

    #[test]
    fn apply_aborts_on_first_failure_and_keeps_earlier_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let sys = SysRoot::at(dir.path().join("sys"));
        let first = sys.join("bus/pci/devices/0000:03:00.0/sriov_numvfs");
        let third = sys.join("bus/pci/devices/0000:07:00.0/sriov_numvfs");
        for attr in [&first, &third] {
            std::fs::create_dir_all(attr.parent().unwrap()).unwrap();
            std::fs::write(attr, "0\n").unwrap();
        }
        // 0000:05:00.0 has no sriov_numvfs attribute; its write must fail

        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([(
            "h1".to_string(),
            vec![
                pf("0000:03:00.0", "intel", 8, 0),
                pf("0000:05:00.0", "intel", 8, 0),
                pf("0000:07:00.0", "intel", 8, 0),
            ],
        )]);
        assert!(matches!(
            policy.apply(&sys, "h1"),
            Err(PolicyError::Sysfs(_))
        ));
        // the PF resized before the failing one stays resized, no rollback
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "8");
        // the PF after the failing one was never reached
        assert_eq!(std::fs::read_to_string(&third).unwrap(), "0\n");
    }

    #[test]
    fn apply_concrete_emits_vfio_instructions() {
        let mut policy = PfPolicy::new(
            &selector("intel"),
            PfPolicyOptions {
                max_vfs: true,
                ..PfPolicyOptions::default()
            },
        )
        .unwrap();
        policy.plan_hosts([(
            "h1".to_string(),
            vec![
                pf("0000:03:00.0", "intel", 8, 2),
                pf("0000:05:00.0", "intel", 0, 0),
            ],
        )]);
        let configs = policy.apply_concrete("h1").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].address.to_string(), "0000:03:00.0");
        assert_eq!(configs[0].num_vfs, 8);
        assert!(configs[0].vfio);
    }

    fn fixture_inventory(dir: &tempfile::TempDir) -> Inventory {
        let machine_id = dir.path().join("machine-id");
        std::fs::write(&machine_id, "f1e2d3c4b5a69788f1e2d3c4b5a69788\n").unwrap();
        std::fs::create_dir_all(dir.path().join("proc")).unwrap();
        Inventory::with_roots(
            SysRoot::at(dir.path().join("sys")),
            dir.path().join("proc"),
            machine_id,
            pci::VendorTable::builtin(),
        )
    }

    fn add_device(sys: &SysRoot, address: &str, class: &str, vendor: &str, device: &str) {
        let dev = sys.join(format!("bus/pci/devices/{address}"));
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("class"), format!("{class}\n")).unwrap();
        std::fs::write(dev.join("vendor"), format!("{vendor}\n")).unwrap();
        std::fs::write(dev.join("device"), format!("{device}\n")).unwrap();
    }

    #[test]
    fn one_bad_config_yields_one_error_and_spares_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = fixture_inventory(&dir);
        let good = inventory
            .sys()
            .join("bus/pci/devices/0000:03:00.0/sriov_numvfs");
        std::fs::create_dir_all(good.parent().unwrap()).unwrap();
        std::fs::write(&good, "0\n").unwrap();

        let configs = vec![
            PfConfig {
                address: pci::Address::parse("0000:09:00.0"),
                num_vfs: 4,
                vfio: false,
            },
            PfConfig {
                address: pci::Address::parse("0000:03:00.0"),
                num_vfs: 4,
                vfio: false,
            },
        ];
        let errors = apply_pf_configs(&inventory, &configs);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].address.to_string(), "0000:09:00.0");
        assert_eq!(std::fs::read_to_string(&good).unwrap(), "4");
    }

    #[test]
    fn vfio_config_unbinds_children_and_registers_their_ids() {
        let dir = tempfile::tempdir().unwrap();
        let inventory = fixture_inventory(&dir);
        let sys = inventory.sys().clone();

        add_device(&sys, "0000:03:00.0", "0x020000", "0x8086", "0x1572");
        let pf_dev = sys.join("bus/pci/devices/0000:03:00.0");
        std::fs::write(pf_dev.join("sriov_totalvfs"), "8\n").unwrap();
        std::fs::write(pf_dev.join("sriov_numvfs"), "2\n").unwrap();

        let driver_dir = sys.join("bus/pci/drivers/iavf");
        std::fs::create_dir_all(&driver_dir).unwrap();
        std::fs::write(driver_dir.join("unbind"), "").unwrap();
        let vfio_dir = sys.join("bus/pci/drivers/vfio-pci");
        std::fs::create_dir_all(&vfio_dir).unwrap();
        std::fs::write(vfio_dir.join("new_id"), "").unwrap();

        for vf_address in ["0000:03:00.1", "0000:03:00.2"] {
            add_device(&sys, vf_address, "0x020000", "0x8086", "0x154c");
            let dev = sys.join(format!("bus/pci/devices/{vf_address}"));
            std::os::unix::fs::symlink("../0000:03:00.0", dev.join("physfn")).unwrap();
            std::os::unix::fs::symlink(&driver_dir, dev.join("driver")).unwrap();
        }

        let configs = vec![PfConfig {
            address: pci::Address::parse("0000:03:00.0"),
            num_vfs: 2,
            vfio: true,
        }];
        let errors = apply_pf_configs(&inventory, &configs);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            std::fs::read_to_string(pf_dev.join("sriov_numvfs")).unwrap(),
            "2"
        );
        assert_eq!(
            std::fs::read_to_string(driver_dir.join("unbind")).unwrap(),
            "0000:03:00.2"
        );
        // one registration per vendor/device pair, bare hex
        assert_eq!(
            std::fs::read_to_string(vfio_dir.join("new_id")).unwrap(),
            "8086 154c"
        );
    }

    #[test]
    fn selector_options_round_trip_through_yaml() {
        let options = selector("intel|pensando");
        let text = serde_yaml_ng::to_string(&options).unwrap();
        assert!(text.contains("kind: vendor_regexp"), "{text}");
        // the pattern travels under the original record's field name
        assert!(text.contains("vendor_regexp:"), "{text}");
        let back: PfSelectorOptions = serde_yaml_ng::from_str(&text).unwrap();
        assert_eq!(back.pattern, "intel|pensando");
    }
}
