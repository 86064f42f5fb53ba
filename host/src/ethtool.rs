// SPDX-License-Identifier: Apache-2.0

//! Driver queries over the `SIOCETHTOOL` ioctl.
//!
//! The classic ethtool interface: a command struct whose address travels in
//! an `ifreq` through a throwaway datagram socket. Used for driver identity
//! (name/version/firmware), link state, statistics counters, and offload
//! feature flags. Commands with variable-size replies (string sets, stats,
//! features) are sized with an `ETHTOOL_GSSET_INFO` round trip first.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};

const ETHTOOL_GDRVINFO: u32 = 0x0000_0003;
const ETHTOOL_GLINK: u32 = 0x0000_000a;
const ETHTOOL_GSTRINGS: u32 = 0x0000_001b;
const ETHTOOL_GSTATS: u32 = 0x0000_001d;
const ETHTOOL_GSSET_INFO: u32 = 0x0000_0037;
const ETHTOOL_GFEATURES: u32 = 0x0000_003a;

const ETH_SS_STATS: u32 = 1;
const ETH_SS_FEATURES: u32 = 4;
const ETH_GSTRING_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EthtoolError {
    #[error("interface name {0:?} does not fit in ifreq")]
    NameTooLong(String),
    #[error("failed to open ethtool control socket: {0}")]
    Socket(#[from] nix::errno::Errno),
    #[error(transparent)]
    Ioctl(#[from] std::io::Error),
    #[error("driver exposes no string set {0}")]
    NoStringSet(u32),
}

/// Driver identity of a kernel network interface.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub driver: String,
    pub version: String,
    pub fw_version: String,
}

// struct ethtool_drvinfo from linux/ethtool.h
#[repr(C)]
struct EthtoolDrvinfo {
    cmd: u32,
    driver: [u8; 32],
    version: [u8; 32],
    fw_version: [u8; 32],
    bus_info: [u8; 32],
    erom_version: [u8; 32],
    reserved2: [u8; 12],
    n_priv_flags: u32,
    n_stats: u32,
    testinfo_len: u32,
    eedump_len: u32,
    regdump_len: u32,
}

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

// struct ethtool_sset_info with room for exactly one set count
#[repr(C)]
struct EthtoolSsetInfo {
    cmd: u32,
    reserved: u32,
    sset_mask: u64,
    count: u32,
}

const GSTRINGS_HDR: usize = 12; // cmd, string_set, len
const GSTATS_HDR: usize = 8; // cmd, n_stats
const GFEATURES_HDR: usize = 8; // cmd, size
const FEATURE_BLOCK: usize = 16; // available, requested, active, never_changed
const FEATURE_ACTIVE_OFFSET: usize = 8;

/// A datagram socket carrying ethtool ioctls.
pub struct EthtoolSocket {
    fd: OwnedFd,
}

impl EthtoolSocket {
    /// Open a control socket.
    ///
    /// # Errors
    ///
    /// [`EthtoolError::Socket`] when the kernel refuses a plain `AF_INET`
    /// datagram socket.
    pub fn open() -> Result<EthtoolSocket, EthtoolError> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )?;
        Ok(EthtoolSocket { fd })
    }

    fn ioctl(&self, interface_name: &str, data: *mut libc::c_void) -> Result<(), EthtoolError> {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let name = interface_name.as_bytes();
        if name.is_empty() || name.len() >= ifr.ifr_name.len() {
            return Err(EthtoolError::NameTooLong(interface_name.to_string()));
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_data = data.cast::<libc::c_char>();
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::SIOCETHTOOL, &raw mut ifr) };
        if rc < 0 {
            return Err(EthtoolError::Ioctl(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// `ETHTOOL_GDRVINFO`: driver name, driver version, firmware version.
    ///
    /// # Errors
    ///
    /// [`EthtoolError`] when the interface does not exist or the driver
    /// rejects the query.
    pub fn drvinfo(&self, interface_name: &str) -> Result<DriverInfo, EthtoolError> {
        let mut info: EthtoolDrvinfo = unsafe { std::mem::zeroed() };
        info.cmd = ETHTOOL_GDRVINFO;
        self.ioctl(interface_name, (&raw mut info).cast())?;
        Ok(DriverInfo {
            driver: fixed_str(&info.driver),
            version: fixed_str(&info.version),
            fw_version: fixed_str(&info.fw_version),
        })
    }

    /// `ETHTOOL_GLINK`: `true` when the link is up.
    ///
    /// # Errors
    ///
    /// [`EthtoolError`] when the interface does not exist.
    pub fn link_state(&self, interface_name: &str) -> Result<bool, EthtoolError> {
        let mut value = EthtoolValue {
            cmd: ETHTOOL_GLINK,
            data: 0,
        };
        self.ioctl(interface_name, (&raw mut value).cast())?;
        Ok(value.data != 0)
    }

    /// Statistics counters by name (`tx_bytes`, `rx_bytes`, ...).
    ///
    /// # Errors
    ///
    /// [`EthtoolError::NoStringSet`] when the driver exposes no statistics;
    /// otherwise whatever the underlying ioctls report.
    pub fn stats(&self, interface_name: &str) -> Result<BTreeMap<String, u64>, EthtoolError> {
        let count = self.string_set_count(interface_name, ETH_SS_STATS)?;
        let names = self.string_set(interface_name, ETH_SS_STATS, count)?;

        let mut buf = aligned_buf(GSTATS_HDR + count as usize * 8);
        write_u32(&mut buf, 0, ETHTOOL_GSTATS);
        write_u32(&mut buf, 4, count);
        self.ioctl(interface_name, buf.as_mut_ptr().cast())?;

        let bytes = buf_bytes(&buf);
        let mut stats = BTreeMap::new();
        for (i, name) in names.into_iter().enumerate() {
            let off = GSTATS_HDR + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[off..off + 8]);
            stats.insert(name, u64::from_ne_bytes(raw));
        }
        Ok(stats)
    }

    /// Offload feature flags by name, reporting the active state.
    ///
    /// # Errors
    ///
    /// [`EthtoolError::NoStringSet`] when the driver exposes no feature
    /// strings; otherwise whatever the underlying ioctls report.
    pub fn features(&self, interface_name: &str) -> Result<BTreeMap<String, bool>, EthtoolError> {
        let count = self.string_set_count(interface_name, ETH_SS_FEATURES)?;
        let names = self.string_set(interface_name, ETH_SS_FEATURES, count)?;

        let blocks = (count as usize).div_ceil(32);
        let mut buf = aligned_buf(GFEATURES_HDR + blocks * FEATURE_BLOCK);
        write_u32(&mut buf, 0, ETHTOOL_GFEATURES);
        write_u32(&mut buf, 4, blocks as u32);
        self.ioctl(interface_name, buf.as_mut_ptr().cast())?;

        let bytes = buf_bytes(&buf);
        let mut features = BTreeMap::new();
        for (i, name) in names.into_iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let off = GFEATURES_HDR + (i / 32) * FEATURE_BLOCK + FEATURE_ACTIVE_OFFSET;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[off..off + 4]);
            let active = u32::from_ne_bytes(raw) & (1 << (i % 32)) != 0;
            features.insert(name, active);
        }
        Ok(features)
    }

    fn string_set_count(&self, interface_name: &str, set: u32) -> Result<u32, EthtoolError> {
        let mut info = EthtoolSsetInfo {
            cmd: ETHTOOL_GSSET_INFO,
            reserved: 0,
            sset_mask: 1 << set,
            count: 0,
        };
        self.ioctl(interface_name, (&raw mut info).cast())?;
        // the kernel clears the mask bit when the set does not exist
        if info.sset_mask & (1 << set) == 0 || info.count == 0 {
            return Err(EthtoolError::NoStringSet(set));
        }
        Ok(info.count)
    }

    fn string_set(
        &self,
        interface_name: &str,
        set: u32,
        count: u32,
    ) -> Result<Vec<String>, EthtoolError> {
        let mut buf = aligned_buf(GSTRINGS_HDR + count as usize * ETH_GSTRING_LEN);
        write_u32(&mut buf, 0, ETHTOOL_GSTRINGS);
        write_u32(&mut buf, 4, set);
        write_u32(&mut buf, 8, count);
        self.ioctl(interface_name, buf.as_mut_ptr().cast())?;

        let bytes = buf_bytes(&buf);
        let names = (0..count as usize)
            .map(|i| {
                let off = GSTRINGS_HDR + i * ETH_GSTRING_LEN;
                fixed_str(&bytes[off..off + ETH_GSTRING_LEN])
            })
            .collect();
        Ok(names)
    }
}

/// Allocate a zeroed, 8-byte-aligned buffer of at least `bytes` bytes.
/// Commands embedding u64 fields require better than Vec<u8> alignment.
fn aligned_buf(bytes: usize) -> Vec<u64> {
    vec![0u64; bytes.div_ceil(8)]
}

fn buf_bytes(buf: &[u64]) -> &[u8] {
    // safe reinterpretation: u64 -> u8 only loosens alignment
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), buf.len() * 8) }
}

fn write_u32(buf: &mut [u64], offset: usize, value: u32) {
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), buf.len() * 8)
    };
    bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// A fixed-size, NUL-padded kernel string field.
fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}
