//! Probe lifecycle: load, configure, attach, poll, teardown.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use aya::maps::{Array, MapData, RingBuf};
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use kernwatch_common::Event;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::drain::EventSink;
use crate::error::{BridgeError, BridgeResult};
use crate::loader;

/// Compiled probe artifact, embedded at build time.
static PROBE_OBJECT: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/kernwatch-ebpf"));

/// Ring poll timeout; also the worst-case latency for observing `stop`.
const POLL_TIMEOUT_MS: i32 = 100;

/// Tracepoint programs: (program, category, name).
const TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sys_enter", "raw_syscalls", "sys_enter"),
    ("sys_exit", "raw_syscalls", "sys_exit"),
    ("sched_process_fork", "sched", "sched_process_fork"),
    ("sched_process_exit", "sched", "sched_process_exit"),
];

/// Kprobe/kretprobe programs: (program, kernel symbol).
const KPROBES: &[(&str, &str)] = &[
    ("do_filp_open", "do_filp_open"),
    ("tcp_sendmsg", "tcp_sendmsg"),
    ("tcp_recvmsg", "tcp_recvmsg"),
    ("tcp_v4_connect", "tcp_v4_connect"),
    ("tcp_v4_connect_ret", "tcp_v4_connect"),
    ("inet_csk_accept", "inet_csk_accept"),
];

/// Process-wide signal target: the running flag of the registered instance.
static SIGNAL_TARGET: Mutex<Option<Arc<AtomicBool>>> = Mutex::new(None);
static SIGNAL_HOOK: Once = Once::new();

struct Loaded {
    ebpf: Ebpf,
    ring: RingBuf<MapData>,
}

/// Supervisor over the kernwatch probes.
///
/// Lifecycle: [`KernelBridge::new`] → [`init`](KernelBridge::init) →
/// [`start`](KernelBridge::start) (blocking) → [`stop`](KernelBridge::stop);
/// teardown happens on [`shutdown`](KernelBridge::shutdown) or drop and is
/// idempotent.
pub struct KernelBridge {
    config: BridgeConfig,
    state: Option<Loaded>,
    sink: Arc<EventSink>,
    running: Arc<AtomicBool>,
}

impl KernelBridge {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            state: None,
            sink: Arc::new(EventSink::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Load the probe artifact, size the event ring, push the initial
    /// configuration, and attach every program.
    ///
    /// Each stage fails with its own [`BridgeError`] variant; partially
    /// loaded state is dropped on failure.
    pub fn init(&mut self, config: BridgeConfig) -> BridgeResult<()> {
        if self.state.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        self.config = config;

        loader::preflight()?;
        if let Err(err) = loader::unlock_map_memory() {
            warn!("could not lift the locked-memory limit: {err}");
        }

        let mut ebpf_loader = EbpfLoader::new();
        ebpf_loader.set_max_entries("EVENTS", self.config.ringbuf_size);
        let mut ebpf = ebpf_loader.load(PROBE_OBJECT)?;

        if let Err(err) = EbpfLogger::init(&mut ebpf) {
            warn!("failed to initialize eBPF logger: {err}");
        }

        write_array(&mut ebpf, "MONITOR_CONFIG", self.config.monitor_config())?;
        write_array(&mut ebpf, "IPS_CFG", self.config.ips.ips_config())?;

        for &(program, category, name) in TRACEPOINTS {
            attach_tracepoint(&mut ebpf, program, category, name)?;
        }
        for &(program, symbol) in KPROBES {
            attach_kprobe(&mut ebpf, program, symbol)?;
        }

        let events_map = ebpf
            .take_map("EVENTS")
            .ok_or(BridgeError::MapNotFound("EVENTS"))?;
        let ring = RingBuf::try_from(events_map)
            .map_err(|err| BridgeError::RingBuffer(format!("ring buffer creation failed: {err}")))?;

        self.state = Some(Loaded { ebpf, ring });
        info!("kernwatch bridge initialized");
        Ok(())
    }

    /// Block draining the ring until [`stop`](KernelBridge::stop) is
    /// observed. Polls with a 100 ms bound; EINTR wakes are not fatal, any
    /// other poll failure terminates with an error.
    pub fn start(&mut self) -> BridgeResult<()> {
        let running = self.running.clone();
        let sink = self.sink.clone();
        let state = self.state.as_mut().ok_or(BridgeError::NotInitialized)?;

        let poller = RingPoller::new(state.ring.as_raw_fd())
            .map_err(|err| BridgeError::RingBuffer(format!("epoll setup failed: {err}")))?;

        running.store(true, Ordering::SeqCst);
        info!("kernwatch bridge started, monitoring events");

        while running.load(Ordering::SeqCst) {
            match poller.wait(POLL_TIMEOUT_MS) {
                Ok(true) => {
                    while let Some(item) = state.ring.next() {
                        sink.ingest(&item);
                    }
                }
                Ok(false) => {
                    // Timeout; loop around and re-check the running flag.
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    running.store(false, Ordering::SeqCst);
                    return Err(BridgeError::RingBuffer(format!("ring poll failed: {err}")));
                }
            }
        }

        info!("kernwatch bridge stopped");
        Ok(())
    }

    /// Request the poll loop to exit; observed within one poll timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a callback invoked on the drainer thread for every event.
    /// The callback must not block; see [`crate::drain::EventCallback`].
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.sink.set_callback(Some(Box::new(callback)));
    }

    pub fn clear_event_callback(&self) {
        self.sink.set_callback(None);
    }

    /// Make this instance the process-wide SIGINT/SIGTERM target.
    ///
    /// At most one live instance owns the target; registering while another
    /// running instance holds it is refused.
    pub fn install_signal_handler(&self) -> BridgeResult<()> {
        {
            let mut target = SIGNAL_TARGET.lock().unwrap();
            if let Some(existing) = target.as_ref() {
                if existing.load(Ordering::SeqCst) && !Arc::ptr_eq(existing, &self.running) {
                    return Err(BridgeError::SignalTargetBusy);
                }
            }
            *target = Some(self.running.clone());
        }

        let mut result = Ok(());
        SIGNAL_HOOK.call_once(|| {
            result = ctrlc::set_handler(|| {
                if let Some(flag) = SIGNAL_TARGET.lock().unwrap().as_ref() {
                    flag.store(false, Ordering::SeqCst);
                }
            })
            .map_err(|err| BridgeError::Signal(err.to_string()));
        });
        result
    }

    /// Detach and free everything. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.state.take().is_some() {
            info!("kernwatch bridge torn down");
        }

        let mut target = SIGNAL_TARGET.lock().unwrap();
        if let Some(existing) = target.as_ref() {
            if Arc::ptr_eq(existing, &self.running) {
                *target = None;
            }
        }
    }

    pub(crate) fn ebpf(&self) -> BridgeResult<&Ebpf> {
        self.state
            .as_ref()
            .map(|state| &state.ebpf)
            .ok_or(BridgeError::NotInitialized)
    }

    pub(crate) fn ebpf_mut(&mut self) -> BridgeResult<&mut Ebpf> {
        self.state
            .as_mut()
            .map(|state| &mut state.ebpf)
            .ok_or(BridgeError::NotInitialized)
    }

    pub(crate) fn sink(&self) -> &EventSink {
        &self.sink
    }
}

impl Default for KernelBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KernelBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn attach_tracepoint(
    ebpf: &mut Ebpf,
    program: &'static str,
    category: &str,
    name: &str,
) -> BridgeResult<()> {
    let tracepoint: &mut TracePoint = ebpf
        .program_mut(program)
        .ok_or(BridgeError::ProgramNotFound(program))?
        .try_into()
        .map_err(|source| BridgeError::Attach { name: program, source })?;
    tracepoint
        .load()
        .map_err(|source| BridgeError::ProgramLoad { name: program, source })?;
    tracepoint
        .attach(category, name)
        .map_err(|source| BridgeError::Attach { name: program, source })?;
    Ok(())
}

fn attach_kprobe(ebpf: &mut Ebpf, program: &'static str, symbol: &str) -> BridgeResult<()> {
    let kprobe: &mut KProbe = ebpf
        .program_mut(program)
        .ok_or(BridgeError::ProgramNotFound(program))?
        .try_into()
        .map_err(|source| BridgeError::Attach { name: program, source })?;
    kprobe
        .load()
        .map_err(|source| BridgeError::ProgramLoad { name: program, source })?;
    kprobe
        .attach(symbol, 0)
        .map_err(|source| BridgeError::Attach { name: program, source })?;
    Ok(())
}

fn write_array<T: aya::Pod>(ebpf: &mut Ebpf, name: &'static str, value: T) -> BridgeResult<()> {
    let map = ebpf.map_mut(name).ok_or(BridgeError::MapNotFound(name))?;
    let mut array: Array<&mut MapData, T> = Array::try_from(map)?;
    array.set(0, value, 0)?;
    Ok(())
}

/// Level-triggered epoll wrapper over the ring-buffer fd.
struct RingPoller {
    epoll: OwnedFd,
}

impl RingPoller {
    fn new(ring_fd: RawFd) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };
        let ret = unsafe {
            libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, ring_fd, &mut event)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { epoll })
    }

    /// Wait up to `timeout_ms`; Ok(true) when the ring is readable.
    fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let ready = unsafe { libc::epoll_wait(self.epoll.as_raw_fd(), &mut event, 1, timeout_ms) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ready > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_bridge_rejects_start() {
        let mut bridge = KernelBridge::new();
        assert!(matches!(bridge.start(), Err(BridgeError::NotInitialized)));
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut bridge = KernelBridge::new();
        bridge.shutdown();
        bridge.shutdown();
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_stop_flag_roundtrip() {
        let bridge = KernelBridge::new();
        bridge.running.store(true, Ordering::SeqCst);
        assert!(bridge.is_running());
        bridge.stop();
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_attach_tables_cover_every_program() {
        // One entry per probe in the artifact; kretprobes share their
        // symbol with the entry half.
        assert_eq!(TRACEPOINTS.len(), 4);
        assert_eq!(KPROBES.len(), 6);
        assert!(KPROBES
            .iter()
            .filter(|(_, symbol)| *symbol == "tcp_v4_connect")
            .count()
            == 2);
    }
}
