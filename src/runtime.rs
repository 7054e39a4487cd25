//! Per-process backend runtime shared by the four frontends.
//!
//! Owns the immutable capability set, the frozen kernel table, the selector
//! and the executor. Frontends only see [`BackendRuntime::run`].

use crate::backend::{BackendKind, CapabilitySet};
use crate::config::RuntimeConfig;
use crate::detect::Detector;
use crate::device::DeviceSet;
use crate::error::{BackendError, SelectError};
use crate::exec::{Cancellation, ExecutionOutcome, Executor};
use crate::registry::{KernelRegistry, Operation, RegistryBuilder, Utility};
use crate::select::{BackendFlag, ExecutionRequest, FallbackChain, Selector};

/// Successful result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed<O> {
    pub output: O,
    pub backend: BackendKind,
}

pub struct BackendRuntime<I, O> {
    utility: Utility,
    flag: BackendFlag,
    caps: CapabilitySet,
    registry: KernelRegistry<I, O>,
    selector: Selector,
    executor: Executor,
}

impl<I, O> BackendRuntime<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Detect once, open devices, let the utility register its kernels and
    /// freeze the table. Devices and the executor share one cancellation
    /// flag, reachable through [`BackendRuntime::cancellation`].
    pub fn init<F>(
        utility: Utility,
        flag: BackendFlag,
        config: &RuntimeConfig,
        detector: &Detector,
        register: F,
    ) -> Result<Self, BackendError>
    where
        F: FnOnce(&mut RegistryBuilder<I, O>, &DeviceSet),
    {
        let caps = detector.detect(flag.probe_scope());
        let cancel = Cancellation::new();
        let devices = DeviceSet::open(&caps, &cancel);
        let mut builder = KernelRegistry::builder();
        register(&mut builder, &devices);
        let registry = builder.build()?;
        let executor = Executor::new(config.kernel_timeout)
            .with_faults(config.fail_backends.clone())
            .with_cancellation(cancel);
        Ok(Self::from_parts(
            utility,
            flag,
            caps,
            registry,
            Selector::new(config.preference.clone()),
            executor,
        ))
    }

    pub fn from_parts(
        utility: Utility,
        flag: BackendFlag,
        caps: CapabilitySet,
        registry: KernelRegistry<I, O>,
        selector: Selector,
        executor: Executor,
    ) -> Self {
        Self {
            utility,
            flag,
            caps,
            registry,
            selector,
            executor,
        }
    }

    pub fn utility(&self) -> Utility {
        self.utility
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn cancellation(&self) -> &Cancellation {
        self.executor.cancellation()
    }

    /// Chain a request for `operation` would use right now.
    pub fn chain(&self, operation: Operation) -> Result<FallbackChain, BackendError> {
        self.selector
            .resolve(self.utility, operation, self.flag, &self.caps, &self.registry)
            .map_err(select_error)
    }

    /// Select and execute one request, translating the outcome.
    pub fn run(&self, operation: Operation, input: I) -> Result<Completed<O>, BackendError> {
        let request = ExecutionRequest::new(self.utility, operation, input, self.flag);
        let chain = self
            .selector
            .select(&request, &self.caps, &self.registry)
            .map_err(select_error)?;
        log::debug!("{}/{operation}: chain {chain}", self.utility);

        match self.executor.execute(&self.registry, &request, &chain) {
            ExecutionOutcome::Success {
                output,
                backend,
                failures,
            } => {
                for diag in &failures {
                    log::warn!("{diag}");
                }
                Ok(Completed { output, backend })
            }
            ExecutionOutcome::BackendFailure {
                backend,
                diagnostic,
            } => {
                if backend.is_gpu() {
                    Err(BackendError::ForcedBackendFailed {
                        backend,
                        diagnostic,
                    })
                } else {
                    Err(BackendError::CpuKernelFailed(diagnostic))
                }
            }
            ExecutionOutcome::ExhaustedFallback {
                attempted,
                last_diagnostic,
                failures,
            } => {
                for diag in &failures {
                    log::warn!("{diag}");
                }
                Err(BackendError::ExhaustedFallback {
                    attempted,
                    last_diagnostic,
                })
            }
            ExecutionOutcome::Cancelled { attempted } => {
                log::info!("{}/{operation}: interrupted", self.utility);
                Err(BackendError::Interrupted { attempted })
            }
            ExecutionOutcome::BackendUnavailable(kind) => Err(BackendError::Unavailable(kind)),
        }
    }
}

fn select_error(err: SelectError) -> BackendError {
    match err {
        SelectError::InvalidOverride { backend, reason } => {
            BackendError::InvalidOverride { backend, reason }
        }
        other @ SelectError::UnknownOperation { .. } => BackendError::Select(other.to_string()),
    }
}
