#![no_std]

//! Shared kernel/userspace schema for the kernwatch sensor.
//!
//! Every type in this crate crosses the eBPF/userspace boundary through a
//! ring buffer or a map, so layouts are fixed:
//!
//! - `#[repr(C)]` (and `packed` for the wire [`Event`]) with explicit padding
//! - Fixed-size arrays only, no heap types
//! - Compile-time size/offset assertions pin every wire offset
//!
//! Userspace enables the `user` feature to get `aya::Pod` impls for map
//! access; the eBPF crate consumes the same definitions under `no_std`.

pub mod ips;

/// Command name length (Linux TASK_COMM_LEN).
pub const COMM_LEN: usize = 16;

/// Maximum contextual payload per event (file path, execve target, IPS tuple).
pub const EVENT_DATA_LEN: usize = 256;

/// Tracked processes (keys in the process/syscall-count maps).
pub const MAX_PROCESSES: u32 = 1024;

/// Tracked source IPs in the brute-force detector (LRU).
pub const MAX_TRACKED_IPS: u32 = 4096;

/// In-flight outbound connects awaiting their return probe (LRU).
pub const MAX_INFLIGHT_CONNECTS: u32 = 4096;

/// Default event ring size in bytes; userspace may override at load time.
pub const DEFAULT_RINGBUF_SIZE: u32 = 256 * 1024;

pub const SSH_PORT: u16 = 22;

// Event kinds, wire-stable across the kernel/userspace boundary.
pub const EVENT_SYSCALL: u32 = 0;
pub const EVENT_FILE: u32 = 1;
pub const EVENT_NETWORK: u32 = 2;
pub const EVENT_PROCESS: u32 = 3;
pub const EVENT_ERROR: u32 = 4;
pub const EVENT_IPS_TCP_CONNECT: u32 = 5;
pub const EVENT_IPS_SSH_ATTEMPT: u32 = 6;
pub const EVENT_IPS_BRUTE_FORCE: u32 = 7;
pub const EVENT_IPS_SSH_AUTH_FAIL: u32 = 8;

// Alert-type namespace carried inside IPS frames (distinct from event kinds).
pub const ALERT_TCP_CONNECT: u8 = 1;
pub const ALERT_SSH_ATTEMPT: u8 = 2;
pub const ALERT_BRUTE_FORCE: u8 = 3;
pub const ALERT_SSH_AUTH_FAIL: u8 = 4;

/// Event frame pushed from the kernel through the ring buffer.
///
/// Packed: the u64 fields sit at unaligned offsets (timestamp at 20).
/// Userspace must decode with an unaligned copy, never by reference.
///
/// Wire offsets:
///   0 kind, 4 pid, 8 ppid, 12 uid, 16 gid, 20 timestamp, 28 syscall_nr,
///   36 ret, 44 comm[16], 60 data[256]; 316 bytes total.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Event {
    /// One of the `EVENT_*` constants.
    pub kind: u32,
    pub pid: u32,
    /// Parent pid where the hook provides it (fork), zero otherwise.
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Monotonic nanoseconds (bpf_ktime_get_ns).
    pub timestamp: u64,
    /// Syscall number for EVENT_SYSCALL frames, zero otherwise.
    pub syscall_nr: u64,
    /// Signed return value where applicable, zero otherwise.
    pub ret: i64,
    /// NUL-padded task comm.
    pub comm: [u8; COMM_LEN],
    /// Contextual payload; IPS frames start with an [`IpsAlert`].
    pub data: [u8; EVENT_DATA_LEN],
}

pub const EVENT_SIZE: usize = 316;

impl Event {
    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            pid: 0,
            ppid: 0,
            uid: 0,
            gid: 0,
            timestamp: 0,
            syscall_nr: 0,
            ret: 0,
            comm: [0u8; COMM_LEN],
            data: [0u8; EVENT_DATA_LEN],
        }
    }

    /// Decode a ring-buffer frame. Returns `None` for short frames; extra
    /// trailing bytes (ring padding) are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EVENT_SIZE {
            return None;
        }
        // Frames are produced by the packed kernel-side write; the copy
        // below is the only sound way to read the unaligned u64s.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<Event>()) })
    }

    /// IPS payload of this frame, if it is an IPS alert kind.
    pub fn ips_alert(&self) -> Option<IpsAlert> {
        match self.kind {
            EVENT_IPS_TCP_CONNECT
            | EVENT_IPS_SSH_ATTEMPT
            | EVENT_IPS_BRUTE_FORCE
            | EVENT_IPS_SSH_AUTH_FAIL => IpsAlert::read_from(&self.data),
            _ => None,
        }
    }
}

/// IPS alert payload, embedded at the start of `Event::data`.
///
/// Field order is wire-fixed: src_ip, dst_ip, src_port, dst_port,
/// fail_count, first_seen_ns, last_seen_ns, then alert_type. IPs are
/// network order, ports host order.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpsAlert {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub fail_count: u32,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    /// One of the `ALERT_*` constants.
    pub alert_type: u8,
    _pad: [u8; 7],
}

pub const IPS_ALERT_SIZE: usize = 40;

impl IpsAlert {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        src_ip: u32,
        dst_ip: u32,
        src_port: u16,
        dst_port: u16,
        fail_count: u32,
        first_seen_ns: u64,
        last_seen_ns: u64,
        alert_type: u8,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            fail_count,
            first_seen_ns,
            last_seen_ns,
            alert_type,
            _pad: [0u8; 7],
        }
    }

    /// Serialize into an event payload buffer.
    pub fn write_to(&self, data: &mut [u8; EVENT_DATA_LEN]) {
        // data is byte-aligned inside the packed Event.
        unsafe { core::ptr::write_unaligned(data.as_mut_ptr().cast::<IpsAlert>(), *self) }
    }

    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < IPS_ALERT_SIZE {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<IpsAlert>()) })
    }
}

/// Per-process record, keyed by pid. Created on the first observed syscall
/// from that pid, deleted on task exit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: [u8; COMM_LEN],
    pub start_time_ns: u64,
}

impl ProcessInfo {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            uid: 0,
            gid: 0,
            comm: [0u8; COMM_LEN],
            start_time_ns: 0,
        }
    }
}

/// Per-source-IP sliding-window state for the brute-force detector.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpTrack {
    pub fail_count: u32,
    _pad: u32,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    /// Start of the active window; only ever moves forward.
    pub window_start_ns: u64,
}

impl IpTrack {
    /// Fresh entry for a source IP seen for the first time.
    pub const fn first_accept(now: u64) -> Self {
        Self {
            fail_count: 0,
            _pad: 0,
            first_seen_ns: now,
            last_seen_ns: now,
            window_start_ns: now,
        }
    }
}

/// General monitoring switches, single-entry array map, key 0.
/// All fields are u32 so each is written atomically.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MonitorConfig {
    pub monitor_all: u32,
    pub monitor_syscalls: u32,
    pub monitor_files: u32,
    pub monitor_network: u32,
    /// Zero means every pid.
    pub target_pid: u32,
}

/// IPS runtime configuration, single-entry array map, key 0.
/// Zero threshold/window select the defaults in [`ips`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IpsConfig {
    pub enabled: u32,
    pub fail_threshold: u32,
    pub time_window_ns: u64,
    pub monitor_all_tcp: u32,
    _pad: u32,
}

impl IpsConfig {
    pub const fn new(
        enabled: bool,
        fail_threshold: u32,
        time_window_ns: u64,
        monitor_all_tcp: bool,
    ) -> Self {
        Self {
            enabled: enabled as u32,
            fail_threshold,
            time_window_ns,
            monitor_all_tcp: monitor_all_tcp as u32,
            _pad: 0,
        }
    }
}

/// Bytes of a NUL-padded buffer up to the first NUL.
pub fn cstr_bytes(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for Event {}
    unsafe impl aya::Pod for IpsAlert {}
    unsafe impl aya::Pod for ProcessInfo {}
    unsafe impl aya::Pod for IpTrack {}
    unsafe impl aya::Pod for MonitorConfig {}
    unsafe impl aya::Pod for IpsConfig {}
}

// Wire layout pins. A change that shifts any offset is a protocol break and
// must fail the build, not surface as garbled events.
const _: () = {
    use core::mem::{offset_of, size_of};

    assert!(size_of::<Event>() == EVENT_SIZE);
    assert!(offset_of!(Event, kind) == 0);
    assert!(offset_of!(Event, pid) == 4);
    assert!(offset_of!(Event, ppid) == 8);
    assert!(offset_of!(Event, uid) == 12);
    assert!(offset_of!(Event, gid) == 16);
    assert!(offset_of!(Event, timestamp) == 20);
    assert!(offset_of!(Event, syscall_nr) == 28);
    assert!(offset_of!(Event, ret) == 36);
    assert!(offset_of!(Event, comm) == 44);
    assert!(offset_of!(Event, data) == 60);

    assert!(size_of::<IpsAlert>() == IPS_ALERT_SIZE);
    assert!(offset_of!(IpsAlert, src_ip) == 0);
    assert!(offset_of!(IpsAlert, dst_ip) == 4);
    assert!(offset_of!(IpsAlert, src_port) == 8);
    assert!(offset_of!(IpsAlert, dst_port) == 10);
    assert!(offset_of!(IpsAlert, fail_count) == 12);
    assert!(offset_of!(IpsAlert, first_seen_ns) == 16);
    assert!(offset_of!(IpsAlert, last_seen_ns) == 24);
    assert!(offset_of!(IpsAlert, alert_type) == 32);

    assert!(size_of::<ProcessInfo>() == 40);
    assert!(size_of::<IpTrack>() == 32);
    assert!(size_of::<MonitorConfig>() == 20);
    assert!(size_of::<IpsConfig>() == 24);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip_through_bytes() {
        let mut event = Event::zeroed();
        event.kind = EVENT_SYSCALL;
        event.pid = 4242;
        event.timestamp = 123_456_789;
        event.syscall_nr = 257;
        event.comm[..4].copy_from_slice(b"curl");

        let bytes = unsafe {
            core::slice::from_raw_parts((&event as *const Event).cast::<u8>(), EVENT_SIZE)
        };
        let decoded = Event::from_bytes(bytes).expect("frame large enough");
        assert_eq!({ decoded.kind }, EVENT_SYSCALL);
        assert_eq!({ decoded.pid }, 4242);
        assert_eq!({ decoded.timestamp }, 123_456_789);
        assert_eq!({ decoded.syscall_nr }, 257);
        assert_eq!(cstr_bytes(&decoded.comm), b"curl");
    }

    #[test]
    fn test_event_from_short_frame() {
        assert!(Event::from_bytes(&[0u8; EVENT_SIZE - 1]).is_none());
        assert!(Event::from_bytes(&[]).is_none());
    }

    #[test]
    fn test_ips_alert_embeds_in_event_data() {
        let alert = IpsAlert::new(
            u32::from_be_bytes([198, 51, 100, 7]),
            0,
            0,
            SSH_PORT,
            3,
            10,
            30,
            ALERT_BRUTE_FORCE,
        );
        let mut event = Event::zeroed();
        event.kind = EVENT_IPS_BRUTE_FORCE;
        alert.write_to(&mut event.data);

        let back = event.ips_alert().expect("ips frame carries payload");
        assert_eq!(back.src_ip, u32::from_be_bytes([198, 51, 100, 7]));
        assert_eq!(back.dst_port, SSH_PORT);
        assert_eq!(back.fail_count, 3);
        assert_eq!(back.first_seen_ns, 10);
        assert_eq!(back.last_seen_ns, 30);
        assert_eq!(back.alert_type, ALERT_BRUTE_FORCE);
    }

    #[test]
    fn test_non_ips_event_has_no_alert() {
        let mut event = Event::zeroed();
        event.kind = EVENT_FILE;
        assert!(event.ips_alert().is_none());
    }

    #[test]
    fn test_cstr_bytes() {
        assert_eq!(cstr_bytes(b"sshd\0\0\0\0"), b"sshd");
        assert_eq!(cstr_bytes(b"full-length-0123"), b"full-length-0123");
        assert_eq!(cstr_bytes(b"\0"), b"");
    }
}
