//! Host preflight: verify the kernel can take the probes before loading.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::error::{BridgeError, BridgeResult};

const BPF_FS: &str = "/sys/fs/bpf";
const BTF_VMLINUX: &str = "/sys/kernel/btf/vmlinux";
const OS_RELEASE: &str = "/proc/sys/kernel/osrelease";

/// Oldest kernel with the ring-buffer map type the probes depend on.
pub const MIN_KERNEL: KernelVersion = KernelVersion {
    major: 5,
    minor: 8,
    patch: 0,
};

/// Running-kernel version triple. Ordering is lexicographic, so
/// `version < MIN_KERNEL` is the support test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Version of the running kernel, if procfs exposes one.
    pub fn current() -> Option<Self> {
        Self::parse(&fs::read_to_string(OS_RELEASE).ok()?)
    }

    /// Accepts distro release strings like "6.8.0-41-generic" or "6.1-rc3":
    /// each dot-separated component contributes its numeric prefix, and a
    /// missing patch component is zero.
    fn parse(release: &str) -> Option<Self> {
        let mut fields = release.trim().splitn(3, '.').map(numeric_prefix);
        let major = fields.next()??;
        let minor = fields.next()??;
        let patch = fields.next().flatten().unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Leading digits of a release component ("0-41-generic" -> 0).
fn numeric_prefix(component: &str) -> Option<u32> {
    let end = component
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(component.len());
    component[..end].parse().ok()
}

/// Check the host before the probe artifact is opened.
///
/// A missing BPF filesystem is a hard failure surfaced as
/// [`BridgeError::Unsupported`]. Absent BTF and old kernels only warn:
/// CO-RE can still relocate against BTF embedded in the artifact, and the
/// kernel check is best-effort on patched distro kernels.
pub fn preflight() -> BridgeResult<()> {
    if !Path::new(BPF_FS).is_dir() {
        return Err(BridgeError::Unsupported(format!(
            "BPF filesystem is not mounted at {BPF_FS}"
        )));
    }

    if !Path::new(BTF_VMLINUX).exists() {
        warn!("no kernel BTF at {BTF_VMLINUX}; probe relocation may fail");
    }

    match KernelVersion::current() {
        Some(version) if version < MIN_KERNEL => {
            warn!("kernel {version} predates {MIN_KERNEL}; the event ring map may be unavailable");
        }
        Some(_) => {}
        None => warn!("could not determine the running kernel version"),
    }

    Ok(())
}

/// Lift RLIMIT_MEMLOCK so map pinning cannot be refused on kernels that
/// still charge BPF memory against it. The caller decides how loudly a
/// failure is reported.
pub(crate) fn unlock_map_memory() -> io::Result<()> {
    let unlimited = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    match unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &unlimited) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_strings() {
        assert_eq!(
            KernelVersion::parse("6.8.0-41-generic\n"),
            Some(KernelVersion {
                major: 6,
                minor: 8,
                patch: 0
            })
        );
        assert_eq!(
            KernelVersion::parse("5.15.167"),
            Some(KernelVersion {
                major: 5,
                minor: 15,
                patch: 167
            })
        );
        // Missing patch component defaults to zero.
        assert_eq!(
            KernelVersion::parse("6.1-rc3"),
            Some(KernelVersion {
                major: 6,
                minor: 1,
                patch: 0
            })
        );
        assert_eq!(KernelVersion::parse("garbage"), None);
        assert_eq!(KernelVersion::parse("6"), None);
    }

    #[test]
    fn test_version_ordering_against_minimum() {
        let old = KernelVersion {
            major: 5,
            minor: 7,
            patch: 19,
        };
        let boundary = KernelVersion {
            major: 5,
            minor: 8,
            patch: 0,
        };
        assert!(old < MIN_KERNEL);
        assert!(boundary >= MIN_KERNEL);
        assert_eq!(boundary.to_string(), "5.8.0");
    }
}
