//! Execution adapter: walk a fallback chain until a kernel succeeds.
//!
//! Every intermediate failure is kept as a [`FallbackDiagnostic`] in the
//! returned [`ExecutionOutcome`]; nothing is logged here. Emission is the
//! caller's job.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::KernelError;
use crate::registry::{KernelDescriptor, KernelRegistry};
use crate::select::{ExecutionRequest, FallbackChain};

/// A recorded kernel failure that led to the next chain entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackDiagnostic {
    pub backend: BackendKind,
    pub reason: String,
    pub next: Option<BackendKind>,
}

impl fmt::Display for FallbackDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend={} status=failed reason=\"{}\"", self.backend, self.reason)?;
        if let Some(next) = self.next {
            write!(f, " next={next}")?;
        }
        Ok(())
    }
}

/// Result of executing one request.
#[derive(Debug)]
pub enum ExecutionOutcome<O> {
    Success {
        output: O,
        backend: BackendKind,
        failures: Vec<FallbackDiagnostic>,
    },
    BackendUnavailable(BackendKind),
    BackendFailure {
        backend: BackendKind,
        diagnostic: String,
    },
    ExhaustedFallback {
        attempted: Vec<BackendKind>,
        last_diagnostic: String,
        failures: Vec<FallbackDiagnostic>,
    },
    /// The cancellation flag fired; the chain was abandoned.
    Cancelled { attempted: Vec<BackendKind> },
}

impl<O> ExecutionOutcome<O> {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Interrupt flag shared by a frontend and its executor.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    timeout: Option<Duration>,
    faults: HashSet<BackendKind>,
    cancel: Cancellation,
}

impl Executor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Attempts on these kinds fail with [`KernelError::Injected`].
    pub fn with_faults(mut self, faults: HashSet<BackendKind>) -> Self {
        self.faults = faults;
        self
    }

    /// Share an interrupt flag, usually the one the devices watch.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn execute<I, O>(
        &self,
        registry: &KernelRegistry<I, O>,
        request: &ExecutionRequest<I>,
        chain: &FallbackChain,
    ) -> ExecutionOutcome<O>
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
    {
        let Some(kernels) = registry.lookup(request.utility, request.operation) else {
            return ExecutionOutcome::BackendUnavailable(
                chain.kinds().first().copied().unwrap_or(BackendKind::Cpu),
            );
        };

        let mut failures = Vec::new();
        let mut attempted = Vec::with_capacity(chain.len());
        let kinds = chain.kinds();
        for (pos, &kind) in kinds.iter().enumerate() {
            let Some(kernel) = kernels.get(kind) else {
                return ExecutionOutcome::BackendUnavailable(kind);
            };
            if self.cancel.is_cancelled() {
                return ExecutionOutcome::Cancelled { attempted };
            }
            attempted.push(kind);
            log::debug!("{}/{}: dispatching on {kind}", request.utility, request.operation);
            match self.attempt(kernel, &request.input) {
                Ok(output) => {
                    return ExecutionOutcome::Success {
                        output,
                        backend: kind,
                        failures,
                    }
                }
                Err(err) => {
                    if err == KernelError::Cancelled || self.cancel.is_cancelled() {
                        return ExecutionOutcome::Cancelled { attempted };
                    }
                    let reason = err.to_string();
                    if kinds.len() == 1 {
                        return ExecutionOutcome::BackendFailure {
                            backend: kind,
                            diagnostic: reason,
                        };
                    }
                    if pos + 1 == kinds.len() {
                        return ExecutionOutcome::ExhaustedFallback {
                            attempted,
                            last_diagnostic: reason,
                            failures,
                        };
                    }
                    failures.push(FallbackDiagnostic {
                        backend: kind,
                        reason,
                        next: kinds.get(pos + 1).copied(),
                    });
                }
            }
        }
        // FallbackChain is never empty.
        ExecutionOutcome::BackendUnavailable(BackendKind::Cpu)
    }

    fn attempt<I, O>(&self, kernel: &KernelDescriptor<I, O>, input: &Arc<I>) -> Result<O, KernelError>
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
    {
        if self.faults.contains(&kernel.backend) {
            return Err(KernelError::Injected);
        }
        match self.timeout {
            Some(limit) if kernel.backend.is_gpu() => run_with_timeout(kernel, input, limit),
            _ => catch_unwind(AssertUnwindSafe(|| kernel.invoke(input)))
                .unwrap_or(Err(KernelError::Panicked)),
        }
    }
}

/// Run a kernel on its own thread and wait at most `limit`. A kernel that
/// overruns keeps running detached; its result is discarded.
fn run_with_timeout<I, O>(
    kernel: &KernelDescriptor<I, O>,
    input: &Arc<I>,
    limit: Duration,
) -> Result<O, KernelError>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    let entry = kernel.entry();
    let input = Arc::clone(input);
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("{}-kernel", kernel.backend))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| (*entry)(&*input)))
                .unwrap_or(Err(KernelError::Panicked));
            let _ = tx.send(result);
        })
        .map_err(|e| KernelError::DeviceLost(format!("cannot start kernel thread: {e}")))?;

    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(KernelError::Timeout(limit.as_millis())),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(KernelError::Panicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Operation, Utility};
    use crate::select::BackendFlag;
    use std::sync::atomic::AtomicUsize;

    const OP: Operation = Operation("line-match");
    use BackendKind::{Cpu, Metal, Vulkan};

    struct Fixture {
        calls: Arc<AtomicUsize>,
        registry: KernelRegistry<u32, String>,
    }

    fn fixture(failing: &[BackendKind]) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = KernelRegistry::<u32, String>::builder();
        for kind in [Cpu, Metal, Vulkan] {
            let fails = failing.contains(&kind);
            let calls = Arc::clone(&calls);
            b.register(KernelDescriptor::new(Utility::Grep, OP, kind, move |x: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                if fails {
                    Err(KernelError::DeviceLost(format!("{kind} went away")))
                } else {
                    Ok(format!("{x}"))
                }
            }));
        }
        Fixture {
            calls,
            registry: b.build().unwrap(),
        }
    }

    fn request() -> ExecutionRequest<u32> {
        ExecutionRequest::new(Utility::Grep, OP, 7, BackendFlag::Default)
    }

    #[test]
    fn success_stops_walking_the_chain() {
        let fx = fixture(&[]);
        let chain = FallbackChain::with_fallback(vec![Metal, Vulkan]);
        match Executor::default().execute(&fx.registry, &request(), &chain) {
            ExecutionOutcome::Success { output, backend, failures } => {
                assert_eq!(output, "7");
                assert_eq!(backend, Metal);
                assert!(failures.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metal_failure_falls_back_to_vulkan() {
        let fx = fixture(&[Metal]);
        let chain = FallbackChain::with_fallback(vec![Metal, Vulkan]);
        match Executor::default().execute(&fx.registry, &request(), &chain) {
            ExecutionOutcome::Success { backend, failures, .. } => {
                assert_eq!(backend, Vulkan);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].backend, Metal);
                assert_eq!(failures[0].next, Some(Vulkan));
                assert!(failures[0].to_string().contains("backend=metal status=failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn every_failure_exhausts_the_chain() {
        let fx = fixture(&[Cpu, Metal, Vulkan]);
        let chain = FallbackChain::with_fallback(vec![Metal, Vulkan]);
        match Executor::default().execute(&fx.registry, &request(), &chain) {
            ExecutionOutcome::ExhaustedFallback { attempted, last_diagnostic, failures } => {
                assert_eq!(attempted, vec![Metal, Vulkan, Cpu]);
                assert!(last_diagnostic.contains("cpu went away"));
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn single_entry_failure_is_terminal() {
        let fx = fixture(&[Vulkan]);
        let chain = FallbackChain::forced(Vulkan);
        match Executor::default().execute(&fx.registry, &request(), &chain) {
            ExecutionOutcome::BackendFailure { backend, diagnostic } => {
                assert_eq!(backend, Vulkan);
                assert!(diagnostic.contains("device lost"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn injected_faults_skip_the_kernel() {
        let fx = fixture(&[]);
        let exec = Executor::default().with_faults([Metal].into_iter().collect());
        let chain = FallbackChain::with_fallback(vec![Metal]);
        let outcome = exec.execute(&fx.registry, &request(), &chain);
        assert!(matches!(outcome, ExecutionOutcome::Success { backend: Cpu, .. }));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_executor_dispatches_nothing() {
        let fx = fixture(&[]);
        let exec = Executor::default();
        exec.cancellation().cancel();
        let outcome = exec.execute(&fx.registry, &request(), &FallbackChain::forced(Cpu));
        match outcome {
            ExecutionOutcome::Cancelled { attempted } => assert!(attempted.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_during_a_kernel_stops_the_chain() {
        let cancel = Cancellation::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = KernelRegistry::<u32, String>::builder();
        for kind in [Metal, Vulkan, Cpu] {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            b.register(KernelDescriptor::new(Utility::Grep, OP, kind, move |_: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                Err(KernelError::DeviceLost("interrupted mid-run".into()))
            }));
        }
        let reg = b.build().unwrap();
        let exec = Executor::default().with_cancellation(cancel);
        let chain = FallbackChain::with_fallback(vec![Metal, Vulkan]);
        match exec.execute(&reg, &request(), &chain) {
            ExecutionOutcome::Cancelled { attempted } => assert_eq!(attempted, vec![Metal]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_gpu_kernel_times_out_and_falls_back() {
        let mut b = KernelRegistry::builder();
        b.register(KernelDescriptor::new(Utility::Grep, OP, Metal, |_: &u32| {
            std::thread::sleep(Duration::from_millis(500));
            Ok("late".to_string())
        }));
        b.register(KernelDescriptor::new(Utility::Grep, OP, Cpu, |_: &u32| {
            Ok("cpu".to_string())
        }));
        let reg = b.build().unwrap();
        let exec = Executor::new(Some(Duration::from_millis(20)));
        let chain = FallbackChain::with_fallback(vec![Metal]);
        match exec.execute(&reg, &request(), &chain) {
            ExecutionOutcome::Success { output, failures, .. } => {
                assert_eq!(output, "cpu");
                assert!(failures[0].reason.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panicking_kernel_is_contained() {
        let mut b = KernelRegistry::builder();
        b.register(KernelDescriptor::new(Utility::Grep, OP, Vulkan, |_: &u32| -> Result<String, KernelError> {
            panic!("shader fault")
        }));
        b.register(KernelDescriptor::new(Utility::Grep, OP, Cpu, |_: &u32| {
            Ok("cpu".to_string())
        }));
        let reg = b.build().unwrap();
        let chain = FallbackChain::with_fallback(vec![Vulkan]);
        let outcome = Executor::default().execute(&reg, &request(), &chain);
        assert!(matches!(outcome, ExecutionOutcome::Success { backend: Cpu, .. }));
    }
}
