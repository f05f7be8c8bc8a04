//! Kernwatch userspace supervisor.
//!
//! Loads the in-kernel tracing probes, pushes their runtime configuration,
//! drains the shared event ring, and answers stats/enumeration queries:
//!
//! - **Bridge**: probe lifecycle (init / start / stop / teardown)
//! - **Drain**: frame validation, callback fan-out, bounded pull queue
//! - **Query**: per-pid stats, process enumeration, config updates
//! - **Loader**: host preflight checks and resource limits
//!
//! The pipeline is lossy by design: the ring can drop under pressure and
//! the pull queue sheds its head at capacity. Consumers needing lossless
//! delivery must build acknowledgement on top of the callback path.

pub mod bridge;
pub mod config;
pub mod drain;
pub mod error;
pub mod loader;
pub mod query;

pub use bridge::KernelBridge;
pub use config::{BridgeConfig, IpsSettings};
pub use drain::{EventCallback, EventSink, SinkCounters, EVENT_QUEUE_CAPACITY};
pub use error::{BridgeError, BridgeResult};
pub use loader::{preflight, KernelVersion, MIN_KERNEL};
pub use query::{BridgeStats, ProcessStats};

// Wire-schema types shared with the kernel side.
pub use kernwatch_common as common;
pub use kernwatch_common::Event;
