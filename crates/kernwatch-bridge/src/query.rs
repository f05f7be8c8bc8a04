//! Synchronous map queries and runtime reconfiguration.
//!
//! Map reads are best-effort snapshots: probes keep writing while userspace
//! iterates, so enumeration may see or miss entries inserted concurrently.

use aya::maps::{Array, HashMap, MapData};
use aya::Ebpf;
use kernwatch_common::{Event, MonitorConfig, ProcessInfo, COMM_LEN};

use crate::bridge::KernelBridge;
use crate::config::IpsSettings;
use crate::error::{BridgeError, BridgeResult};

/// Joined per-process view: identity from the process map, counter from
/// the syscall-count map. All-zero when the pid is unknown.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcessStats {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: [u8; COMM_LEN],
    pub start_time_ns: u64,
    pub syscall_count: u64,
}

impl ProcessStats {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            uid: 0,
            gid: 0,
            comm: [0u8; COMM_LEN],
            start_time_ns: 0,
            syscall_count: 0,
        }
    }

    pub fn comm_str(&self) -> String {
        String::from_utf8_lossy(kernwatch_common::cstr_bytes(&self.comm)).into_owned()
    }
}

/// Supervisor-level counters reported by [`KernelBridge::get_stats`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BridgeStats {
    /// Live entries in the process map.
    pub process_count: u32,
    /// Current pull-queue depth.
    pub events_pending: u32,
    /// Frames accepted by the drainer since init.
    pub total_events: u64,
    /// Undersized frames dropped at validation.
    pub short_frames: u64,
    /// Events shed from the head of the full pull queue.
    pub queue_drops: u64,
}

fn join_stats(info: Option<ProcessInfo>, count: Option<u64>) -> ProcessStats {
    let mut stats = ProcessStats::zeroed();
    if let Some(info) = info {
        stats.pid = info.pid;
        stats.ppid = info.ppid;
        stats.uid = info.uid;
        stats.gid = info.gid;
        stats.comm = info.comm;
        stats.start_time_ns = info.start_time_ns;
    }
    if let Some(count) = count {
        stats.syscall_count = count;
    }
    stats
}

fn lookup_process(ebpf: &Ebpf, pid: u32) -> BridgeResult<Option<ProcessInfo>> {
    let map = ebpf
        .map("PROCESSES")
        .ok_or(BridgeError::MapNotFound("PROCESSES"))?;
    let processes: HashMap<&MapData, u32, ProcessInfo> = HashMap::try_from(map)?;
    Ok(processes.get(&pid, 0).ok())
}

fn lookup_count(ebpf: &Ebpf, pid: u32) -> BridgeResult<Option<u64>> {
    let map = ebpf
        .map("SYSCALL_COUNTS")
        .ok_or(BridgeError::MapNotFound("SYSCALL_COUNTS"))?;
    let counts: HashMap<&MapData, u32, u64> = HashMap::try_from(map)?;
    Ok(counts.get(&pid, 0).ok())
}

impl KernelBridge {
    /// Flip the monitoring switches in place; `target_pid` is preserved.
    pub fn set_monitoring_config(
        &mut self,
        syscalls: bool,
        files: bool,
        network: bool,
        all: bool,
    ) -> BridgeResult<()> {
        let ebpf = self.ebpf_mut()?;
        let map = ebpf
            .map_mut("MONITOR_CONFIG")
            .ok_or(BridgeError::MapNotFound("MONITOR_CONFIG"))?;
        let mut array: Array<&mut MapData, MonitorConfig> = Array::try_from(map)?;

        let mut cfg = array.get(&0, 0).unwrap_or_default();
        cfg.monitor_syscalls = syscalls as u32;
        cfg.monitor_files = files as u32;
        cfg.monitor_network = network as u32;
        cfg.monitor_all = all as u32;
        array.set(0, cfg, 0)?;
        Ok(())
    }

    /// Push a fresh IPS configuration into the kernel.
    pub fn set_ips_config(&mut self, settings: &IpsSettings) -> BridgeResult<()> {
        let ebpf = self.ebpf_mut()?;
        let map = ebpf
            .map_mut("IPS_CFG")
            .ok_or(BridgeError::MapNotFound("IPS_CFG"))?;
        let mut array: Array<&mut MapData, kernwatch_common::IpsConfig> = Array::try_from(map)?;
        array.set(0, settings.ips_config(), 0)?;
        Ok(())
    }

    /// Per-pid stats; the zero record when the pid is unknown to both maps.
    pub fn get_process_stats(&self, pid: u32) -> BridgeResult<ProcessStats> {
        let ebpf = self.ebpf()?;
        let info = lookup_process(ebpf, pid)?;
        let count = lookup_count(ebpf, pid)?;
        Ok(join_stats(info, count))
    }

    /// Enumerate every tracked process by key iteration.
    pub fn get_all_process_stats(&self) -> BridgeResult<Vec<ProcessStats>> {
        let ebpf = self.ebpf()?;
        let map = ebpf
            .map("PROCESSES")
            .ok_or(BridgeError::MapNotFound("PROCESSES"))?;
        let processes: HashMap<&MapData, u32, ProcessInfo> = HashMap::try_from(map)?;

        let mut all = Vec::new();
        for key in processes.keys() {
            // Keys deleted mid-iteration are skipped, not errors.
            let Ok(pid) = key else { continue };
            let stats = self.get_process_stats(pid)?;
            if stats.pid != 0 {
                all.push(stats);
            }
        }
        Ok(all)
    }

    /// Pop the oldest queued event. Non-blocking.
    pub fn get_next_event(&self) -> Option<Event> {
        self.sink().pop()
    }

    /// Pop up to `max` queued events in arrival order. Non-blocking.
    pub fn get_events(&self, max: usize) -> Vec<Event> {
        self.sink().pop_many(max)
    }

    /// Current process count, queue depth, and drainer counters.
    /// Usable before `init`; map-backed figures are zero until then.
    pub fn get_stats(&self) -> BridgeStats {
        use std::sync::atomic::Ordering;

        let process_count = self
            .ebpf()
            .ok()
            .and_then(|ebpf| ebpf.map("PROCESSES"))
            .and_then(|map| HashMap::<&MapData, u32, ProcessInfo>::try_from(map).ok())
            .map(|processes| processes.keys().filter(|key| key.is_ok()).count())
            .unwrap_or(0);

        let counters = self.sink().counters();
        BridgeStats {
            process_count: process_count as u32,
            events_pending: self.sink().depth() as u32,
            total_events: counters.total_events.load(Ordering::Relaxed),
            short_frames: counters.short_frames.load(Ordering::Relaxed),
            queue_drops: counters.queue_drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(pid: u32) -> ProcessInfo {
        let mut info = ProcessInfo::zeroed();
        info.pid = pid;
        info.uid = 1000;
        info.comm[..4].copy_from_slice(b"sshd");
        info.start_time_ns = 42;
        info
    }

    #[test]
    fn test_join_with_both_sides() {
        let stats = join_stats(Some(sample_info(7)), Some(19));
        assert_eq!(stats.pid, 7);
        assert_eq!(stats.uid, 1000);
        assert_eq!(stats.syscall_count, 19);
        assert_eq!(stats.comm_str(), "sshd");
    }

    #[test]
    fn test_join_with_missing_counter() {
        let stats = join_stats(Some(sample_info(7)), None);
        assert_eq!(stats.pid, 7);
        assert_eq!(stats.syscall_count, 0);
    }

    #[test]
    fn test_join_without_process_record_is_zero_identity() {
        let stats = join_stats(None, Some(3));
        assert_eq!(stats.pid, 0);
        assert_eq!(stats.syscall_count, 3);
    }

    #[test]
    fn test_join_with_nothing_is_the_zero_record() {
        let stats = join_stats(None, None);
        assert_eq!(stats.pid, 0);
        assert_eq!(stats.syscall_count, 0);
        assert_eq!(stats.comm, [0u8; COMM_LEN]);
    }

    #[test]
    fn test_queries_before_init() {
        let bridge = KernelBridge::new();
        assert!(bridge.get_next_event().is_none());
        assert!(bridge.get_events(16).is_empty());
        assert!(matches!(
            bridge.get_process_stats(1),
            Err(BridgeError::NotInitialized)
        ));
        let stats = bridge.get_stats();
        assert_eq!(stats.process_count, 0);
        assert_eq!(stats.events_pending, 0);
    }
}
