//! Error types for the kernwatch bridge.

use thiserror::Error;

/// Errors surfaced by the supervisor. Kernel-side probes never raise
/// errors; everything here originates in userspace lifecycle or map access.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Host preflight failed; the probes cannot load here.
    #[error("unsupported host: {0}")]
    Unsupported(String),

    /// The probe artifact was rejected at open/load time.
    #[error("failed to load probe artifact: {0}")]
    Load(#[from] aya::EbpfError),

    /// A program failed kernel verification during per-program load.
    #[error("failed to load program {name}: {source}")]
    ProgramLoad {
        name: &'static str,
        source: aya::programs::ProgramError,
    },

    /// A program could not attach (missing symbol, permission denied).
    #[error("failed to attach probe {name}: {source}")]
    Attach {
        name: &'static str,
        source: aya::programs::ProgramError,
    },

    /// A program named in the attach table is absent from the artifact.
    #[error("program {0} not found in probe artifact")]
    ProgramNotFound(&'static str),

    /// Ring-buffer creation or polling failure.
    #[error("ring buffer error: {0}")]
    RingBuffer(String),

    /// Map lookup/update failure outside the tolerated-miss paths.
    #[error("map access error: {0}")]
    Map(#[from] aya::maps::MapError),

    /// A named map is absent from the loaded artifact.
    #[error("map {0} not found in probe artifact")]
    MapNotFound(&'static str),

    /// Lifecycle misuse: operation requires a completed `init`.
    #[error("bridge is not initialized")]
    NotInitialized,

    /// `init` called while a previous load is still live.
    #[error("bridge is already initialized")]
    AlreadyInitialized,

    /// Another live instance already owns the process signal target.
    #[error("another bridge instance is the signal target")]
    SignalTargetBusy,

    /// Signal handler installation failed.
    #[error("failed to install signal handler: {0}")]
    Signal(String),
}

impl BridgeError {
    /// Stage code reported through the C facade: open/load failures are -1,
    /// attach failures -2, ring-buffer failures -3, map/config writes -4.
    pub fn stage_code(&self) -> i32 {
        match self {
            BridgeError::Unsupported(_) | BridgeError::Load(_) | BridgeError::ProgramLoad { .. } => {
                -1
            }
            BridgeError::Attach { .. } | BridgeError::ProgramNotFound(_) => -2,
            BridgeError::RingBuffer(_) => -3,
            BridgeError::Map(_) | BridgeError::MapNotFound(_) => -4,
            BridgeError::NotInitialized
            | BridgeError::AlreadyInitialized
            | BridgeError::SignalTargetBusy
            | BridgeError::Signal(_) => -5,
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_codes_are_distinct_per_stage() {
        assert_eq!(BridgeError::Unsupported("no bpffs".into()).stage_code(), -1);
        assert_eq!(BridgeError::ProgramNotFound("sys_enter").stage_code(), -2);
        assert_eq!(BridgeError::RingBuffer("epoll".into()).stage_code(), -3);
        assert_eq!(BridgeError::MapNotFound("EVENTS").stage_code(), -4);
        assert_eq!(BridgeError::NotInitialized.stage_code(), -5);
        assert_eq!(BridgeError::AlreadyInitialized.stage_code(), -5);
    }
}
