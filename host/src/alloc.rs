// SPDX-License-Identifier: Apache-2.0

//! VFIO allocation tracking.
//!
//! A VF handed to a process through VFIO shows up as an open file
//! descriptor on the group's `/dev/vfio/<n>` character device. Scanning
//! every process's descriptor table therefore recovers which IOMMU groups
//! are currently claimed, without any cooperation from the consumers.
//!
//! The scan is best-effort by design: processes exit and descriptors close
//! while we walk, and an unreadable entry must skip that entry, not abort
//! the scan. The walk is O(processes × open fds), so callers annotate a
//! whole VF collection from one scan rather than scanning per VF.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static VFIO_DEV_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // the pattern is a compile-time constant
    Regex::new(r"^/dev/vfio/[0-9]+$").unwrap()
});

/// Collect every `/dev/vfio/<n>` target held open by any process.
///
/// `proc_root` is the process table directory, `/proc` on a live system.
/// Per-process and per-descriptor failures are skipped; only a failure to
/// read the process table itself is an error.
///
/// # Errors
///
/// [`std::io::Error`] when `proc_root` cannot be enumerated.
pub fn vfio_allocations(proc_root: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut allocations = Vec::new();
    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else {
            continue;
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            // process exited or we lack permission for it; not our problem
            debug!("skipping unreadable {}", fd_dir.display());
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(target) = target.to_str() else {
                continue;
            };
            if VFIO_DEV_RE.is_match(&target.to_lowercase()) {
                allocations.push(target.to_string());
            }
        }
    }
    Ok(allocations)
}

/// Whether the VFIO device node for `iommu_group` appears in an allocation
/// scan result.
#[must_use]
pub fn is_allocated(allocations: &[String], iommu_group: &str) -> bool {
    let device = format!("/dev/vfio/{iommu_group}");
    allocations.iter().any(|allocation| *allocation == device)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::vf::{Vf, Vfs};
    use pci::Address;

    fn fake_proc(
        procs: &[(&str, &[&str])],
    ) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, targets) in procs {
            let fd_dir = dir.path().join(pid).join("fd");
            std::fs::create_dir_all(&fd_dir).unwrap();
            for (i, target) in targets.iter().enumerate() {
                std::os::unix::fs::symlink(target, fd_dir.join(i.to_string())).unwrap();
            }
        }
        dir
    }

    #[test]
    fn collects_vfio_descriptors_only() {
        let proc_root = fake_proc(&[
            ("4211", &["/dev/vfio/12", "/dev/null", "/tmp/some.log"]),
            ("980", &["/dev/vfio/7"]),
        ]);
        let mut allocations = vfio_allocations(proc_root.path()).unwrap();
        allocations.sort();
        assert_eq!(allocations, vec!["/dev/vfio/12", "/dev/vfio/7"]);
    }

    #[test]
    fn non_numeric_and_fd_less_entries_are_skipped() {
        let proc_root = fake_proc(&[("312", &["/dev/vfio/3"])]);
        std::fs::create_dir_all(proc_root.path().join("sys")).unwrap();
        // numeric entry with no fd directory, like a process that just died
        std::fs::create_dir_all(proc_root.path().join("999")).unwrap();
        let allocations = vfio_allocations(proc_root.path()).unwrap();
        assert_eq!(allocations, vec!["/dev/vfio/3"]);
    }

    #[test]
    fn is_allocated_matches_exact_group_device() {
        let allocations = vec!["/dev/vfio/12".to_string()];
        assert!(is_allocated(&allocations, "12"));
        assert!(!is_allocated(&allocations, "1"));
        assert!(!is_allocated(&allocations, "123"));
    }

    #[test]
    fn mark_allocations_annotates_exactly_matching_vfs() {
        let mut vfs = Vfs(vec![
            Vf {
                address: Address::parse("0000:03:00.1"),
                iommu_group: "12".to_string(),
                ..Vf::default()
            },
            Vf {
                address: Address::parse("0000:03:00.2"),
                iommu_group: "13".to_string(),
                ..Vf::default()
            },
        ]);
        vfs.mark_allocations(&["/dev/vfio/12".to_string()]);
        assert!(vfs.0[0].allocated);
        assert!(!vfs.0[1].allocated);
    }
}
