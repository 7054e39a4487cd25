use thiserror::Error;

use crate::backend::BackendKind;
use crate::registry::{Operation, Utility};

/// Exit code for a failed explicit single-backend override.
pub const EXIT_INVALID_OVERRIDE: i32 = 69;
/// Exit code when every backend of a fallback chain failed.
pub const EXIT_EXHAUSTED_FALLBACK: i32 = 70;
/// Exit code when the kernel table is missing a CPU kernel.
pub const EXIT_REGISTRY: i32 = 71;
/// Exit code after SIGINT, as a shell reports it.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Failure raised by a single kernel invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The device went away while the kernel was running.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Input shape the kernel cannot handle (too large, bad alignment).
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// Device allocation failed.
    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    /// Kernel did not finish within the configured timeout.
    #[error("kernel timed out after {0} ms")]
    Timeout(u128),

    /// Kernel panicked; the panic was contained.
    #[error("kernel panicked")]
    Panicked,

    /// Failure forced through `GPU_UTILS_FAIL_BACKENDS`.
    #[error("injected failure")]
    Injected,

    /// The process was interrupted before or while the kernel ran.
    #[error("cancelled by interrupt")]
    Cancelled,

    /// Domain level failure reported by the kernel itself.
    #[error("{0}")]
    Domain(String),
}

/// Registry construction failure. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no cpu kernel registered for {utility}/{operation}")]
    MissingCpuKernel { utility: Utility, operation: Operation },

    #[error("duplicate {backend} kernel registered for {utility}/{operation}")]
    DuplicateKernel {
        utility: Utility,
        operation: Operation,
        backend: BackendKind,
    },
}

/// Selection failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// Explicit single-backend flag that cannot be honoured.
    #[error("cannot use --{backend}: {reason}")]
    InvalidOverride { backend: BackendKind, reason: String },

    #[error("unknown operation {utility}/{operation}")]
    UnknownOperation { utility: Utility, operation: Operation },
}

/// Terminal backend condition surfaced to a frontend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend={backend} status=invalid-override reason=\"{reason}\"")]
    InvalidOverride { backend: BackendKind, reason: String },

    #[error("backend={backend} status=forced-failed reason=\"{diagnostic}\"")]
    ForcedBackendFailed {
        backend: BackendKind,
        diagnostic: String,
    },

    #[error("status=exhausted attempted={} reason=\"{last_diagnostic}\"", join_kinds(.attempted))]
    ExhaustedFallback {
        attempted: Vec<BackendKind>,
        last_diagnostic: String,
    },

    /// CPU kernel failure under a `[cpu]` chain; a domain error.
    #[error("{0}")]
    CpuKernelFailed(String),

    #[error("backend={0} status=unavailable")]
    Unavailable(BackendKind),

    /// Interrupt received; no further backend was tried.
    #[error("status=interrupted attempted={}", join_kinds(.attempted))]
    Interrupted { attempted: Vec<BackendKind> },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Select(String),
}

impl BackendError {
    /// Dedicated exit code for backend conditions, `None` for domain errors
    /// that the frontend maps to its own code.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BackendError::InvalidOverride { .. } | BackendError::ForcedBackendFailed { .. } => {
                Some(EXIT_INVALID_OVERRIDE)
            }
            BackendError::ExhaustedFallback { .. } => Some(EXIT_EXHAUSTED_FALLBACK),
            BackendError::Registry(_) | BackendError::Unavailable(_) | BackendError::Select(_) => {
                Some(EXIT_REGISTRY)
            }
            BackendError::Interrupted { .. } => Some(EXIT_INTERRUPTED),
            BackendError::CpuKernelFailed(_) => None,
        }
    }
}

/// Configuration failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {msg}")]
    Invalid { key: String, msg: String },

    #[error("config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn join_kinds(kinds: &[BackendKind]) -> String {
    kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(",")
}
