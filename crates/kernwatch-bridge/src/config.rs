//! Bridge configuration and its projection into the kernel config maps.

use std::time::Duration;

use kernwatch_common::{ips, IpsConfig, MonitorConfig, DEFAULT_RINGBUF_SIZE};

/// Supervisor configuration, fixed at `init` time. The monitoring switches
/// can be flipped later through the config map; the ring size cannot.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Event ring size in bytes, applied to the EVENTS map before load.
    pub ringbuf_size: u32,
    pub monitor_syscalls: bool,
    pub monitor_files: bool,
    pub monitor_network: bool,
    /// Gates the fork/exit tracepoints.
    pub monitor_all: bool,
    /// Restrict syscall/file/network events to one pid; zero means all.
    pub target_pid: u32,
    pub ips: IpsSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ringbuf_size: DEFAULT_RINGBUF_SIZE,
            monitor_syscalls: true,
            monitor_files: false,
            monitor_network: false,
            monitor_all: false,
            target_pid: 0,
            ips: IpsSettings::default(),
        }
    }
}

impl BridgeConfig {
    pub(crate) fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            monitor_all: self.monitor_all as u32,
            monitor_syscalls: self.monitor_syscalls as u32,
            monitor_files: self.monitor_files as u32,
            monitor_network: self.monitor_network as u32,
            target_pid: self.target_pid,
        }
    }
}

/// Brute-force detector settings.
#[derive(Debug, Clone)]
pub struct IpsSettings {
    pub enabled: bool,
    /// Accepts within the window before a brute-force alert.
    pub fail_threshold: u32,
    /// Sliding-window length.
    pub time_window: Duration,
    /// Also alert on non-SSH outbound connects.
    pub monitor_all_tcp: bool,
}

impl Default for IpsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_threshold: ips::DEFAULT_FAIL_THRESHOLD,
            time_window: Duration::from_nanos(ips::DEFAULT_TIME_WINDOW_NS),
            monitor_all_tcp: false,
        }
    }
}

impl IpsSettings {
    pub(crate) fn ips_config(&self) -> IpsConfig {
        IpsConfig::new(
            self.enabled,
            self.fail_threshold,
            self.time_window.as_nanos() as u64,
            self.monitor_all_tcp,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.ringbuf_size, DEFAULT_RINGBUF_SIZE);
        assert!(config.monitor_syscalls);
        assert!(!config.monitor_files);
        assert!(!config.monitor_network);
        assert!(!config.monitor_all);
        assert_eq!(config.target_pid, 0);
        assert!(config.ips.enabled);
        assert!(!config.ips.monitor_all_tcp);
    }

    #[test]
    fn test_monitor_config_projection() {
        let mut config = BridgeConfig::default();
        config.monitor_files = true;
        config.target_pid = 4242;
        let projected = config.monitor_config();
        assert_eq!(projected.monitor_syscalls, 1);
        assert_eq!(projected.monitor_files, 1);
        assert_eq!(projected.monitor_network, 0);
        assert_eq!(projected.target_pid, 4242);
    }

    #[test]
    fn test_ips_config_projection() {
        let settings = IpsSettings {
            enabled: true,
            fail_threshold: 3,
            time_window: Duration::from_secs(60),
            monitor_all_tcp: true,
        };
        let projected = settings.ips_config();
        assert_eq!(projected.enabled, 1);
        assert_eq!(projected.fail_threshold, 3);
        assert_eq!(projected.time_window_ns, 60_000_000_000);
        assert_eq!(projected.monitor_all_tcp, 1);
    }
}
