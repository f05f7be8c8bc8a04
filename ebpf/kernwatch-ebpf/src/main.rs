#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid,
        bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, kretprobe, map, tracepoint},
    maps::{Array, HashMap, LruHashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use kernwatch_common::{
    ips, Event, IpTrack, IpsAlert, IpsConfig, MonitorConfig, ProcessInfo, ALERT_BRUTE_FORCE,
    ALERT_SSH_ATTEMPT, ALERT_SSH_AUTH_FAIL, ALERT_TCP_CONNECT, COMM_LEN, DEFAULT_RINGBUF_SIZE,
    EVENT_DATA_LEN, EVENT_FILE, EVENT_IPS_BRUTE_FORCE, EVENT_IPS_SSH_ATTEMPT,
    EVENT_IPS_SSH_AUTH_FAIL, EVENT_IPS_TCP_CONNECT, EVENT_NETWORK, EVENT_PROCESS, EVENT_SYSCALL,
    MAX_INFLIGHT_CONNECTS, MAX_PROCESSES, MAX_TRACKED_IPS, SSH_PORT,
};

// =============================================================================
// Maps
// =============================================================================

/// Ring buffer carrying every event frame to userspace. The supervisor may
/// resize this map before load.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RINGBUF_SIZE, 0);

/// Per-pid process records, seeded on first observed syscall.
#[map]
static PROCESSES: HashMap<u32, ProcessInfo> = HashMap::with_max_entries(MAX_PROCESSES, 0);

/// Per-pid syscall counters.
#[map]
static SYSCALL_COUNTS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_PROCESSES, 0);

/// General monitoring switches, written by userspace (single entry, key 0).
#[map]
static MONITOR_CONFIG: Array<MonitorConfig> = Array::with_max_entries(1, 0);

/// IPS runtime configuration, written by userspace (single entry, key 0).
#[map]
static IPS_CFG: Array<IpsConfig> = Array::with_max_entries(1, 0);

/// Per-source-IP sliding-window counters for inbound SSH accepts.
/// LRU: sustained multi-IP floods evict the oldest trackers.
#[map]
static SSH_TRACKER: LruHashMap<u32, IpTrack> = LruHashMap::with_max_entries(MAX_TRACKED_IPS, 0);

/// Socket pointers stashed between the connect entry and return probes,
/// keyed by pid_tgid. Entries live only across one connect call; LRU
/// eviction covers tasks that never reach the return half.
#[map]
static CONNECT_ARGS: LruHashMap<u64, u64> =
    LruHashMap::with_max_entries(MAX_INFLIGHT_CONNECTS, 0);

// x86_64 syscall numbers whose path argument is copied into the event.
const SYS_OPEN: i64 = 2;
const SYS_EXECVE: i64 = 59;
const SYS_OPENAT: i64 = 257;
const SYS_EXECVEAT: i64 = 322;

// raw_syscalls tracepoint data: id at 8, args[6] from 16.
const SYS_ENTER_ID_OFFSET: usize = 8;
const SYS_ENTER_ARG0_OFFSET: usize = 16;
const SYS_ENTER_ARG1_OFFSET: usize = 24;

// =============================================================================
// Helpers
// =============================================================================

#[inline(always)]
fn monitor_config() -> MonitorConfig {
    MONITOR_CONFIG.get(0).copied().unwrap_or_default()
}

#[inline(always)]
fn ips_config() -> IpsConfig {
    IPS_CFG.get(0).copied().unwrap_or_default()
}

#[inline(always)]
fn current_pid() -> u32 {
    (bpf_get_current_pid_tgid() >> 32) as u32
}

#[inline(always)]
fn pid_allowed(cfg: &MonitorConfig, pid: u32) -> bool {
    cfg.target_pid == 0 || cfg.target_pid == pid
}

/// Fill identity fields from the current task context.
#[inline(always)]
fn fill_task_identity(event: &mut Event) {
    let pid_tgid = bpf_get_current_pid_tgid();
    event.pid = (pid_tgid >> 32) as u32;
    // Parent pid would need a task_struct walk; fork frames carry it instead.
    event.ppid = 0;
    let uid_gid = bpf_get_current_uid_gid();
    event.uid = (uid_gid & 0xffff_ffff) as u32;
    event.gid = (uid_gid >> 32) as u32;
    event.timestamp = unsafe { bpf_ktime_get_ns() };
    event.syscall_nr = 0;
    event.ret = 0;
    event.comm = [0u8; COMM_LEN];
    if let Ok(comm) = bpf_get_current_comm() {
        event.comm = comm;
    }
    event.data = [0u8; EVENT_DATA_LEN];
}

/// Seed the process record on first sight and bump its syscall counter.
#[inline(always)]
fn touch_process(pid: u32) {
    if unsafe { PROCESSES.get(&pid) }.is_none() {
        let mut info = ProcessInfo::zeroed();
        info.pid = pid;
        let uid_gid = bpf_get_current_uid_gid();
        info.uid = (uid_gid & 0xffff_ffff) as u32;
        info.gid = (uid_gid >> 32) as u32;
        info.start_time_ns = unsafe { bpf_ktime_get_ns() };
        if let Ok(comm) = bpf_get_current_comm() {
            info.comm = comm;
        }
        let _ = PROCESSES.insert(&pid, &info, 0);
    }

    match SYSCALL_COUNTS.get_ptr_mut(&pid) {
        Some(count) => unsafe { *count += 1 },
        None => {
            let one = 1u64;
            let _ = SYSCALL_COUNTS.insert(&pid, &one, 0);
        }
    }
}

/// Copy a prefix plus an optional decimal value into the payload buffer.
/// Loops are bounded by the const prefix length and the digit cap.
#[inline(always)]
fn write_desc<const N: usize>(
    data: &mut [u8; EVENT_DATA_LEN],
    prefix: &[u8; N],
    value: Option<u64>,
) {
    let mut pos = 0usize;
    let mut i = 0usize;
    while i < N && pos < EVENT_DATA_LEN - 1 {
        data[pos] = prefix[i];
        pos += 1;
        i += 1;
    }
    if let Some(mut v) = value {
        let mut digits = [0u8; 20];
        let mut n = 0usize;
        loop {
            digits[n] = b'0' + (v % 10) as u8;
            v /= 10;
            n += 1;
            if v == 0 || n >= 20 {
                break;
            }
        }
        while n > 0 && pos < EVENT_DATA_LEN - 1 {
            n -= 1;
            data[pos] = digits[n];
            pos += 1;
        }
    }
}

/// Reserve, fill, and submit one IPS alert frame.
#[allow(clippy::too_many_arguments)]
#[inline(always)]
fn submit_ips_alert(
    kind: u32,
    alert_type: u8,
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    fail_count: u32,
    first_seen_ns: u64,
    last_seen_ns: u64,
) {
    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return,
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return;
        }
    };

    fill_task_identity(event);
    event.kind = kind;
    IpsAlert::new(
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        fail_count,
        first_seen_ns,
        last_seen_ns,
        alert_type,
    )
    .write_to(&mut event.data);

    entry.submit(0);
}

/// Read the IPv4 four-tuple out of a `struct sock *`.
///
/// Uses stable sock_common offsets (x86_64, 5.4+):
///   0 skc_daddr, 4 skc_rcv_saddr, 12 skc_dport (network order),
///   14 skc_num (host order).
#[inline(always)]
fn read_sock_tuple(sk: *const u8) -> Result<(u32, u32, u16, u16), i64> {
    let dst_ip: u32 = unsafe { bpf_probe_read_kernel(sk as *const u32).map_err(|_| 1i64)? };
    let src_ip: u32 =
        unsafe { bpf_probe_read_kernel(sk.add(4) as *const u32).map_err(|_| 1i64)? };
    let dst_port: u16 =
        u16::from_be(unsafe { bpf_probe_read_kernel(sk.add(12) as *const u16).map_err(|_| 1i64)? });
    let src_port: u16 =
        unsafe { bpf_probe_read_kernel(sk.add(14) as *const u16).map_err(|_| 1i64)? };
    Ok((src_ip, dst_ip, src_port, dst_port))
}

// =============================================================================
// Syscall tracepoints (raw_syscalls)
// =============================================================================

#[tracepoint]
pub fn sys_enter(ctx: TracePointContext) -> u32 {
    match try_sys_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sys_enter(ctx: &TracePointContext) -> Result<(), i64> {
    let cfg = monitor_config();
    if cfg.monitor_syscalls == 0 {
        return Ok(());
    }
    let pid = current_pid();
    if !pid_allowed(&cfg, pid) {
        return Ok(());
    }

    touch_process(pid);

    let id: i64 = unsafe { ctx.read_at(SYS_ENTER_ID_OFFSET).map_err(|_| 1i64)? };
    // Resolve the path argument before reserving so no frame leaks on error.
    let path_ptr: u64 = match id {
        SYS_OPEN | SYS_EXECVE => unsafe {
            ctx.read_at(SYS_ENTER_ARG0_OFFSET).unwrap_or_default()
        },
        SYS_OPENAT | SYS_EXECVEAT => unsafe {
            ctx.read_at(SYS_ENTER_ARG1_OFFSET).unwrap_or_default()
        },
        _ => 0,
    };

    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    fill_task_identity(event);
    event.kind = EVENT_SYSCALL;
    event.syscall_nr = id as u64;
    if path_ptr != 0 {
        let _ = unsafe {
            bpf_probe_read_user_str_bytes(path_ptr as *const u8, &mut event.data)
        };
    }

    entry.submit(0);
    Ok(())
}

/// Attached alongside sys_enter; return capture is reserved, so the gate
/// runs and nothing is emitted.
#[tracepoint]
pub fn sys_exit(_ctx: TracePointContext) -> u32 {
    let cfg = monitor_config();
    if cfg.monitor_syscalls == 0 {
        return 0;
    }
    let pid = current_pid();
    if !pid_allowed(&cfg, pid) {
        return 0;
    }
    0
}

// =============================================================================
// File open kprobe
// =============================================================================

#[kprobe]
pub fn do_filp_open(ctx: ProbeContext) -> u32 {
    match try_do_filp_open(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_do_filp_open(ctx: &ProbeContext) -> Result<(), i64> {
    let cfg = monitor_config();
    if cfg.monitor_files == 0 {
        return Ok(());
    }
    let pid = current_pid();
    if !pid_allowed(&cfg, pid) {
        return Ok(());
    }

    // arg1 is `struct filename *`; the resolved text is its first field.
    let name_struct: *const u8 = ctx.arg(1).ok_or(1i64)?;
    let name_ptr: u64 =
        unsafe { bpf_probe_read_kernel(name_struct as *const u64).map_err(|_| 1i64)? };

    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    fill_task_identity(event);
    event.kind = EVENT_FILE;
    if name_ptr != 0 {
        let _ = unsafe {
            bpf_probe_read_kernel_str_bytes(name_ptr as *const u8, &mut event.data)
        };
    }

    entry.submit(0);
    Ok(())
}

// =============================================================================
// TCP send/receive kprobes
// =============================================================================

#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_sendmsg(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tcp_sendmsg(ctx: &ProbeContext) -> Result<(), i64> {
    let cfg = monitor_config();
    if cfg.monitor_network == 0 {
        return Ok(());
    }
    let pid = current_pid();
    if !pid_allowed(&cfg, pid) {
        return Ok(());
    }

    let size: u64 = ctx.arg(2).ok_or(1i64)?;

    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    fill_task_identity(event);
    event.kind = EVENT_NETWORK;
    write_desc(&mut event.data, b"tcp_send: size=", Some(size));

    entry.submit(0);
    Ok(())
}

#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_recvmsg(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tcp_recvmsg(_ctx: &ProbeContext) -> Result<(), i64> {
    let cfg = monitor_config();
    if cfg.monitor_network == 0 {
        return Ok(());
    }
    let pid = current_pid();
    if !pid_allowed(&cfg, pid) {
        return Ok(());
    }

    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    fill_task_identity(event);
    event.kind = EVENT_NETWORK;
    write_desc(&mut event.data, b"tcp_recv", None);

    entry.submit(0);
    Ok(())
}

// =============================================================================
// Process fork/exit tracepoints (sched)
// =============================================================================

/// sched_process_fork data, after the 8 common bytes.
/// See /sys/kernel/debug/tracing/events/sched/sched_process_fork/format.
#[repr(C)]
struct SchedProcessForkArgs {
    _common: [u8; 8],
    _parent_comm: [u8; COMM_LEN],
    parent_pid: i32,
    child_comm: [u8; COMM_LEN],
    child_pid: i32,
}

#[tracepoint]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    match try_sched_process_fork(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sched_process_fork(ctx: &TracePointContext) -> Result<(), i64> {
    let cfg = monitor_config();
    if cfg.monitor_all == 0 {
        return Ok(());
    }

    let args: SchedProcessForkArgs = unsafe { ctx.read_at(0).map_err(|_| 1i64)? };

    let mut entry = match EVENTS.reserve::<Event>(0) {
        Some(entry) => entry,
        None => return Ok(()),
    };
    let event = match unsafe { entry.as_mut_ptr().as_mut() } {
        Some(event) => event,
        None => {
            entry.discard(0);
            return Ok(());
        }
    };

    fill_task_identity(event);
    event.kind = EVENT_PROCESS;
    event.pid = args.child_pid as u32;
    event.ppid = args.parent_pid as u32;
    event.comm = args.child_comm;
    write_desc(&mut event.data, b"fork from pid=", Some(args.parent_pid as u64));

    entry.submit(0);
    Ok(())
}

#[tracepoint]
pub fn sched_process_exit(_ctx: TracePointContext) -> u32 {
    let cfg = monitor_config();
    if cfg.monitor_all == 0 {
        return 0;
    }

    // Drop the per-pid records; the exit itself is not surfaced.
    let pid = current_pid();
    let _ = PROCESSES.remove(&pid);
    let _ = SYSCALL_COUNTS.remove(&pid);
    0
}

// =============================================================================
// Outbound connect kprobe/kretprobe pair (IPS)
// =============================================================================

#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    match try_tcp_v4_connect(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tcp_v4_connect(ctx: &ProbeContext) -> Result<(), i64> {
    let cfg = ips_config();
    if cfg.enabled == 0 {
        return Ok(());
    }

    let sk: *const u8 = ctx.arg(0).ok_or(1i64)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    let sk_addr = sk as u64;
    CONNECT_ARGS.insert(&pid_tgid, &sk_addr, 0).map_err(|_| 1i64)?;
    Ok(())
}

#[kretprobe]
pub fn tcp_v4_connect_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_v4_connect_ret(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tcp_v4_connect_ret(ctx: &RetProbeContext) -> Result<(), i64> {
    let cfg = ips_config();
    if cfg.enabled == 0 {
        return Ok(());
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    let sk_addr = match unsafe { CONNECT_ARGS.get(&pid_tgid) } {
        Some(sk_addr) => *sk_addr,
        None => return Ok(()),
    };
    // The stash is deleted whether or not the connect succeeded.
    let _ = CONNECT_ARGS.remove(&pid_tgid);

    let ret: i64 = ctx.ret().ok_or(1i64)?;
    if ret != 0 {
        return Ok(());
    }

    let (src_ip, dst_ip, src_port, dst_port) = read_sock_tuple(sk_addr as *const u8)?;
    let now = unsafe { bpf_ktime_get_ns() };

    if src_port == SSH_PORT || dst_port == SSH_PORT {
        submit_ips_alert(
            EVENT_IPS_SSH_ATTEMPT,
            ALERT_SSH_ATTEMPT,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            0,
            now,
            now,
        );
    } else if cfg.monitor_all_tcp != 0 {
        submit_ips_alert(
            EVENT_IPS_TCP_CONNECT,
            ALERT_TCP_CONNECT,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            0,
            now,
            now,
        );
    }

    Ok(())
}

// =============================================================================
// Inbound SSH accept kretprobe (IPS)
// =============================================================================

#[kretprobe]
pub fn inet_csk_accept(ctx: RetProbeContext) -> u32 {
    match try_inet_csk_accept(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_inet_csk_accept(ctx: &RetProbeContext) -> Result<(), i64> {
    let cfg = ips_config();
    if cfg.enabled == 0 {
        return Ok(());
    }

    let sk: *const u8 = ctx.ret().ok_or(1i64)?;
    if sk.is_null() {
        return Ok(());
    }

    let local_port: u16 =
        unsafe { bpf_probe_read_kernel(sk.add(14) as *const u16).map_err(|_| 1i64)? };
    if local_port != SSH_PORT {
        return Ok(());
    }

    let src_ip: u32 = unsafe { bpf_probe_read_kernel(sk as *const u32).map_err(|_| 1i64)? };
    let now = unsafe { bpf_ktime_get_ns() };

    let track = match SSH_TRACKER.get_ptr_mut(&src_ip) {
        Some(track) => unsafe { &mut *track },
        None => {
            // First accept from this source seeds the tracker uncounted.
            let track = IpTrack::first_accept(now);
            let _ = SSH_TRACKER.insert(&src_ip, &track, 0);
            submit_ips_alert(
                EVENT_IPS_SSH_ATTEMPT,
                ALERT_SSH_ATTEMPT,
                src_ip,
                0,
                0,
                SSH_PORT,
                0,
                now,
                now,
            );
            return Ok(());
        }
    };

    let obs = ips::observe_accept(track, &cfg, now);
    match obs.alert {
        ips::Alert::BruteForce => {
            debug!(
                ctx,
                "ssh brute force: src={:i} count={}",
                u32::from_be(src_ip),
                obs.fail_count
            );
            submit_ips_alert(
                EVENT_IPS_BRUTE_FORCE,
                ALERT_BRUTE_FORCE,
                src_ip,
                0,
                0,
                SSH_PORT,
                obs.fail_count,
                obs.first_seen_ns,
                obs.last_seen_ns,
            );
        }
        ips::Alert::AuthFail => {
            submit_ips_alert(
                EVENT_IPS_SSH_AUTH_FAIL,
                ALERT_SSH_AUTH_FAIL,
                src_ip,
                0,
                0,
                SSH_PORT,
                obs.fail_count,
                obs.first_seen_ns,
                obs.last_seen_ns,
            );
        }
    }

    Ok(())
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
