//! Backend runtime shared by the GPU-accelerated `find`, `grep`, `sed` and
//! `gawk` frontends.
//!
//! A frontend parses its arguments, registers the CPU kernel for its
//! operation plus GPU kernels for every opened device, and hands each unit of
//! work to [`BackendRuntime::run`]. Selection and fallback happen behind that
//! call; the output shape never depends on the backend that produced it.

pub mod backend;
pub mod cli;
pub mod config;
pub mod detect;
pub mod device;
pub mod error;
pub mod exec;
pub mod io_utils;
pub mod kernels;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod select;
pub mod tile;

pub use backend::{BackendCapability, BackendKind, CapabilitySet};
pub use config::{Preference, RuntimeConfig};
pub use detect::{BackendProbe, Detector, ProbeScope};
pub use error::{
    BackendError, ConfigError, KernelError, RegistryError, SelectError, EXIT_EXHAUSTED_FALLBACK,
    EXIT_INTERRUPTED, EXIT_INVALID_OVERRIDE, EXIT_REGISTRY,
};
pub use exec::{Cancellation, ExecutionOutcome, Executor, FallbackDiagnostic};
pub use registry::{KernelDescriptor, KernelRegistry, Operation, RegistryBuilder, Utility};
pub use runtime::{BackendRuntime, Completed};
pub use select::{BackendFlag, ExecutionRequest, FallbackChain, Selector};
