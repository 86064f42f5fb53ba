// SPDX-License-Identifier: Apache-2.0

//! [sysfs] access utilities for the SR-IOV manager.
//!
//! Minor guard rails to discourage mistakes when reading and writing
//! system-impacting kernel attribute files as a privileged process.
//!
//! All reads and writes in this crate are anchored under a [`SysRoot`]: for
//! the live system that root is the real sysfs mount point (located through
//! the mount table and verified with `statfs`), while tests and remote
//! snapshots can anchor the same code at any directory shaped like sysfs.
//!
//! [sysfs]: https://www.kernel.org/doc/Documentation/filesystems/sysfs.txt

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Errors which might occur when accessing a sysfs tree.
#[derive(Debug, thiserror::Error)]
pub enum SysfsError {
    /// No sysfs filesystem is mounted.
    #[error("sysfs is not mounted")]
    NotMounted,
    /// sysfs appears to be mounted in more than one place.
    ///
    /// This is a suspicious configuration; refusing to guess which mount to
    /// use is safer than writing control files under the wrong one.
    #[error("sysfs is mounted at more than one location")]
    AmbiguousMount,
    /// The path claimed to be sysfs does not have the sysfs filesystem magic.
    #[error("path {0:?} is not under sysfs")]
    NotUnderSysfs(PathBuf),
    /// Some [`std::io::Error`] occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The kernel only uses ASCII byte strings for sysfs names, so invalid
    /// UTF-8 under sysfs means something is deeply wrong. The offending
    /// bytes are deliberately not included here: mangling a system log with
    /// attacker-influenced unprintable bytes helps nobody.
    #[error("path under sysfs is not a valid UTF-8 string")]
    NotUtf8,
    /// An attribute file did not contain the expected integer.
    #[error("attribute {path:?} does not hold an integer: {source}")]
    NotAnInteger {
        path: PathBuf,
        source: std::num::ParseIntError,
    },
}

/// The root of a sysfs-shaped directory tree.
///
/// Every sysfs path this workspace touches is expressed relative to a
/// `SysRoot`, which is either the verified live mount
/// ([`SysRoot::discover`]) or an arbitrary fixture tree ([`SysRoot::at`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysRoot(PathBuf);

impl SysRoot {
    /// Locate the real sysfs mount point and verify it.
    ///
    /// The mount table is scanned for `sysfs` entries and the resulting path
    /// is checked against `SYSFS_MAGIC`.
    ///
    /// # Errors
    ///
    /// - [`SysfsError::NotMounted`] when no sysfs entry exists
    /// - [`SysfsError::AmbiguousMount`] when more than one does
    /// - [`SysfsError::NotUnderSysfs`] when the mount entry lies about its
    ///   filesystem type
    pub fn discover() -> Result<SysRoot, SysfsError> {
        let mounts: Vec<_> = procfs::mounts()
            .map_err(|e| SysfsError::Io(std::io::Error::other(e)))?
            .into_iter()
            .filter(|mount| mount.fs_vfstype == "sysfs")
            .collect();
        let path = match mounts.as_slice() {
            [] => return Err(SysfsError::NotMounted),
            [mount] => PathBuf::from(&mount.fs_file),
            _ => return Err(SysfsError::AmbiguousMount),
        };
        let path = std::fs::canonicalize(&path)?;
        match nix::sys::statfs::statfs(&path) {
            Ok(stats) => {
                if stats.filesystem_type() == nix::sys::statfs::SYSFS_MAGIC {
                    info!("found sysfs filesystem at {}", path.display());
                    Ok(SysRoot(path))
                } else {
                    Err(SysfsError::NotUnderSysfs(path))
                }
            }
            Err(errno) => Err(SysfsError::Io(errno.into())),
        }
    }

    /// Anchor at an arbitrary directory without validation.
    ///
    /// Intended for fixture trees in tests and for snapshots of sysfs state
    /// shipped from another host. Nothing prevents pointing this at a
    /// directory that is not shaped like sysfs; reads will simply fail.
    pub fn at(path: impl Into<PathBuf>) -> SysRoot {
        SysRoot(path.into())
    }

    /// The root directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// A path relative to this root. Purely lexical; no canonicalization.
    #[must_use]
    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.0.join(rel)
    }
}

impl std::fmt::Display for SysRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Read an attribute file as a string, trimming the trailing newline.
///
/// # Errors
///
/// Propagates I/O failures; non-UTF-8 content is reported as
/// [`SysfsError::NotUtf8`].
pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String, SysfsError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s.trim_end_matches('\n').to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(SysfsError::NotUtf8),
        Err(e) => Err(SysfsError::Io(e)),
    }
}

/// Read an attribute file holding a single decimal integer.
///
/// # Errors
///
/// Propagates read failures; non-numeric content is
/// [`SysfsError::NotAnInteger`].
pub fn read_u32(path: impl AsRef<Path>) -> Result<u32, SysfsError> {
    let path = path.as_ref();
    let s = read_trimmed(path)?;
    s.parse().map_err(|source| SysfsError::NotAnInteger {
        path: path.to_path_buf(),
        source,
    })
}

/// Write bytes to a kernel control file.
///
/// The file is opened write-only and never created: a missing control file
/// means the device or driver is gone, which is an error the caller needs
/// to see, not a file we should conjure up.
///
/// # Errors
///
/// Any [`std::io::Error`] from open or write.
pub fn write_attr(path: impl AsRef<Path>, data: &[u8]) -> Result<(), SysfsError> {
    let path = path.as_ref();
    debug!("writing {} bytes to {}", data.len(), path.display());
    let mut options = std::fs::OpenOptions::new();
    options.write(true).truncate(true);
    let mut file = options.open(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Resolve a symlink and return the final component of its target.
///
/// Best-effort: any failure (the link vanished, permissions, dangling
/// target) yields `None`. sysfs expresses most associations — a device's
/// driver, its IOMMU group, a VF's parent — as symlinks whose target
/// basename is the interesting value.
#[must_use]
pub fn symlink_basename(path: impl AsRef<Path>) -> Option<String> {
    let resolved = std::fs::canonicalize(path.as_ref()).ok()?;
    resolved
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}
