//! C-compatible facade over the kernwatch bridge.
//!
//! An opaque handle wraps one [`KernelBridge`]; every exported operation
//! uses a plain-data calling convention so consumers in other languages can
//! bind without knowledge of the internal object layout. Null handles and
//! null out-pointers are tolerated no-ops.
//!
//! Init failures return a negative code per stage: -1 open/load, -2 attach,
//! -3 ring buffer, -4 map/config, -5 lifecycle misuse or null argument.

use std::ffi::c_void;
use std::time::Duration;

use kernwatch_bridge::{
    BridgeConfig, BridgeStats, IpsSettings, KernelBridge, ProcessStats,
};
use kernwatch_common::Event;

/// Code returned for null handles/arguments and lifecycle misuse.
const KERNWATCH_EINVAL: i32 = -5;

/// Opaque handle over one supervisor instance.
pub struct KernwatchHandle {
    bridge: KernelBridge,
}

/// Plain-data mirror of [`BridgeConfig`]. Zero `ringbuf_size`,
/// `ips_fail_threshold`, or `ips_time_window_ns` select the defaults.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct KernwatchConfig {
    pub ringbuf_size: u32,
    pub monitor_syscalls: u32,
    pub monitor_files: u32,
    pub monitor_network: u32,
    pub monitor_all: u32,
    pub target_pid: u32,
    pub ips_enabled: u32,
    pub ips_fail_threshold: u32,
    pub ips_time_window_ns: u64,
    pub ips_monitor_all_tcp: u32,
}

impl KernwatchConfig {
    fn to_bridge_config(self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        let ips_defaults = IpsSettings::default();
        BridgeConfig {
            ringbuf_size: if self.ringbuf_size == 0 {
                defaults.ringbuf_size
            } else {
                self.ringbuf_size
            },
            monitor_syscalls: self.monitor_syscalls != 0,
            monitor_files: self.monitor_files != 0,
            monitor_network: self.monitor_network != 0,
            monitor_all: self.monitor_all != 0,
            target_pid: self.target_pid,
            ips: IpsSettings {
                enabled: self.ips_enabled != 0,
                fail_threshold: if self.ips_fail_threshold == 0 {
                    ips_defaults.fail_threshold
                } else {
                    self.ips_fail_threshold
                },
                time_window: if self.ips_time_window_ns == 0 {
                    ips_defaults.time_window
                } else {
                    Duration::from_nanos(self.ips_time_window_ns)
                },
                monitor_all_tcp: self.ips_monitor_all_tcp != 0,
            },
        }
    }
}

/// Event callback: invoked on the drainer thread, must not block.
pub type KernwatchEventCallback =
    Option<unsafe extern "C" fn(event: *const Event, user_data: *mut c_void)>;

struct CallbackShim {
    callback: unsafe extern "C" fn(*const Event, *mut c_void),
    user_data: *mut c_void,
}

// The caller owns user_data and promises it outlives the callback
// registration; the shim only forwards the pointer.
unsafe impl Send for CallbackShim {}

/// Allocate a new, uninitialized bridge handle.
#[no_mangle]
pub extern "C" fn kernwatch_create() -> *mut KernwatchHandle {
    Box::into_raw(Box::new(KernwatchHandle {
        bridge: KernelBridge::new(),
    }))
}

/// Tear down and free a handle. Accepts null.
///
/// # Safety
/// `handle` must come from [`kernwatch_create`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_destroy(handle: *mut KernwatchHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Load and attach the probes with the given configuration.
/// Returns 0 on success, a negative stage code otherwise.
///
/// # Safety
/// `handle` must be a live handle; `config` must be null or point to a
/// valid [`KernwatchConfig`].
#[no_mangle]
pub unsafe extern "C" fn kernwatch_init(
    handle: *mut KernwatchHandle,
    config: *const KernwatchConfig,
) -> i32 {
    let Some(handle) = handle.as_mut() else {
        return KERNWATCH_EINVAL;
    };
    let bridge_config = if config.is_null() {
        BridgeConfig::default()
    } else {
        (*config).to_bridge_config()
    };
    match handle.bridge.init(bridge_config) {
        Ok(()) => 0,
        Err(err) => err.stage_code(),
    }
}

/// Block draining events until [`kernwatch_stop`] is observed.
/// Returns 0 on clean stop, a negative code on a fatal poll error.
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_start(handle: *mut KernwatchHandle) -> i32 {
    let Some(handle) = handle.as_mut() else {
        return KERNWATCH_EINVAL;
    };
    match handle.bridge.start() {
        Ok(()) => 0,
        Err(err) => err.stage_code(),
    }
}

/// Request the poll loop to exit.
///
/// # Safety
/// `handle` must be a live handle or null.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_stop(handle: *mut KernwatchHandle) {
    if let Some(handle) = handle.as_ref() {
        handle.bridge.stop();
    }
}

/// # Safety
/// `handle` must be a live handle or null.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_is_running(handle: *const KernwatchHandle) -> bool {
    handle
        .as_ref()
        .map(|handle| handle.bridge.is_running())
        .unwrap_or(false)
}

/// Make this instance the process-wide SIGINT/SIGTERM target.
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_install_signal_handler(handle: *mut KernwatchHandle) -> i32 {
    let Some(handle) = handle.as_ref() else {
        return KERNWATCH_EINVAL;
    };
    match handle.bridge.install_signal_handler() {
        Ok(()) => 0,
        Err(err) => err.stage_code(),
    }
}

/// Register (or, with a null callback, clear) the event callback.
/// The callback runs on the drainer thread and must not block.
///
/// # Safety
/// `handle` must be a live handle; `user_data` must stay valid until the
/// callback is cleared or the handle destroyed.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_set_callback(
    handle: *mut KernwatchHandle,
    callback: KernwatchEventCallback,
    user_data: *mut c_void,
) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    match callback {
        Some(callback) => {
            let shim = CallbackShim {
                callback,
                user_data,
            };
            handle.bridge.set_event_callback(move |event| {
                let shim = &shim;
                unsafe { (shim.callback)(event as *const Event, shim.user_data) };
            });
        }
        None => handle.bridge.clear_event_callback(),
    }
}

/// Pop the oldest queued event into `out`. Returns false when empty.
///
/// # Safety
/// `handle` must be a live handle; `out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_get_next_event(
    handle: *mut KernwatchHandle,
    out: *mut Event,
) -> bool {
    let Some(handle) = handle.as_ref() else {
        return false;
    };
    if out.is_null() {
        return false;
    }
    match handle.bridge.get_next_event() {
        Some(event) => {
            out.write(event);
            true
        }
        None => false,
    }
}

/// Pop up to `capacity` events into `out`; returns how many were written.
///
/// # Safety
/// `out` must point to at least `capacity` writable [`Event`] slots.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_get_events(
    handle: *mut KernwatchHandle,
    out: *mut Event,
    capacity: usize,
) -> usize {
    let Some(handle) = handle.as_ref() else {
        return 0;
    };
    if out.is_null() || capacity == 0 {
        return 0;
    }
    let events = handle.bridge.get_events(capacity);
    for (i, event) in events.iter().enumerate() {
        out.add(i).write(*event);
    }
    events.len()
}

/// Joined per-pid stats; the zero record when the pid is unknown or the
/// bridge is not initialized.
///
/// # Safety
/// `handle` must be a live handle; `out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_get_process_stats(
    handle: *mut KernwatchHandle,
    pid: u32,
    out: *mut ProcessStats,
) -> bool {
    let Some(handle) = handle.as_ref() else {
        return false;
    };
    if out.is_null() {
        return false;
    }
    let stats = handle
        .bridge
        .get_process_stats(pid)
        .unwrap_or_else(|_| ProcessStats::zeroed());
    out.write(stats);
    true
}

/// Enumerate tracked processes into `out`; returns how many were written.
///
/// # Safety
/// `out` must point to at least `capacity` writable [`ProcessStats`] slots.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_get_all_process_stats(
    handle: *mut KernwatchHandle,
    out: *mut ProcessStats,
    capacity: usize,
) -> usize {
    let Some(handle) = handle.as_ref() else {
        return 0;
    };
    if out.is_null() || capacity == 0 {
        return 0;
    }
    let all = match handle.bridge.get_all_process_stats() {
        Ok(all) => all,
        Err(_) => return 0,
    };
    let count = all.len().min(capacity);
    for (i, stats) in all[..count].iter().enumerate() {
        out.add(i).write(*stats);
    }
    count
}

/// Flip the monitoring switches; `target_pid` is preserved.
/// Returns 0 on success, a negative stage code otherwise.
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_set_monitoring_config(
    handle: *mut KernwatchHandle,
    syscalls: u32,
    files: u32,
    network: u32,
    all: u32,
) -> i32 {
    let Some(handle) = handle.as_mut() else {
        return KERNWATCH_EINVAL;
    };
    match handle
        .bridge
        .set_monitoring_config(syscalls != 0, files != 0, network != 0, all != 0)
    {
        Ok(()) => 0,
        Err(err) => err.stage_code(),
    }
}

/// Current process count, queue depth, and drainer counters.
///
/// # Safety
/// `handle` must be a live handle; `out` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn kernwatch_get_stats(
    handle: *mut KernwatchHandle,
    out: *mut BridgeStats,
) -> bool {
    let Some(handle) = handle.as_ref() else {
        return false;
    };
    if out.is_null() {
        return false;
    }
    out.write(handle.bridge.get_stats());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_create_destroy_roundtrip() {
        let handle = kernwatch_create();
        assert!(!handle.is_null());
        unsafe {
            assert!(!kernwatch_is_running(handle));
            kernwatch_destroy(handle);
        }
    }

    #[test]
    fn test_null_handles_are_tolerated() {
        unsafe {
            kernwatch_destroy(ptr::null_mut());
            kernwatch_stop(ptr::null_mut());
            assert!(!kernwatch_is_running(ptr::null()));
            assert_eq!(kernwatch_init(ptr::null_mut(), ptr::null()), KERNWATCH_EINVAL);
            assert_eq!(kernwatch_start(ptr::null_mut()), KERNWATCH_EINVAL);
            assert!(!kernwatch_get_next_event(ptr::null_mut(), ptr::null_mut()));
            assert_eq!(kernwatch_get_events(ptr::null_mut(), ptr::null_mut(), 8), 0);
            assert!(!kernwatch_get_stats(ptr::null_mut(), ptr::null_mut()));
        }
    }

    #[test]
    fn test_empty_queue_reports_no_event() {
        let handle = kernwatch_create();
        let mut event = Event::zeroed();
        unsafe {
            assert!(!kernwatch_get_next_event(handle, &mut event));
            assert_eq!(kernwatch_get_events(handle, &mut event, 1), 0);
            kernwatch_destroy(handle);
        }
    }

    #[test]
    fn test_stats_on_fresh_handle_are_zero() {
        let handle = kernwatch_create();
        let mut stats = BridgeStats::default();
        unsafe {
            assert!(kernwatch_get_stats(handle, &mut stats));
            kernwatch_destroy(handle);
        }
        assert_eq!(stats.process_count, 0);
        assert_eq!(stats.events_pending, 0);
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn test_config_zeroes_select_defaults() {
        let config = KernwatchConfig {
            ringbuf_size: 0,
            monitor_syscalls: 1,
            monitor_files: 0,
            monitor_network: 0,
            monitor_all: 0,
            target_pid: 0,
            ips_enabled: 1,
            ips_fail_threshold: 0,
            ips_time_window_ns: 0,
            ips_monitor_all_tcp: 0,
        };
        let bridge_config = config.to_bridge_config();
        assert_eq!(
            bridge_config.ringbuf_size,
            kernwatch_common::DEFAULT_RINGBUF_SIZE
        );
        assert!(bridge_config.monitor_syscalls);
        assert_eq!(bridge_config.ips.fail_threshold, 5);
        assert_eq!(bridge_config.ips.time_window, Duration::from_secs(300));
    }
}
