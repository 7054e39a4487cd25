//! Resolve command line flags, capabilities and registered kernels into the
//! ordered fallback chain for one request.

use std::fmt;
use std::sync::Arc;

use crate::backend::{BackendKind, CapabilitySet};
use crate::config::Preference;
use crate::detect::ProbeScope;
use crate::error::SelectError;
use crate::registry::{KernelRegistry, Operation, Utility};

/// Backend flag given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendFlag {
    /// No flag: same resolution as `--gpu`.
    #[default]
    Default,
    Gpu,
    Cpu,
    Metal,
    Vulkan,
}

impl BackendFlag {
    /// The single backend a flag forces, if any.
    pub fn explicit_override(self) -> Option<BackendKind> {
        match self {
            BackendFlag::Cpu => Some(BackendKind::Cpu),
            BackendFlag::Metal => Some(BackendKind::Metal),
            BackendFlag::Vulkan => Some(BackendKind::Vulkan),
            BackendFlag::Default | BackendFlag::Gpu => None,
        }
    }

    pub fn cpu_only(self) -> bool {
        self == BackendFlag::Cpu
    }

    pub fn probe_scope(self) -> ProbeScope {
        if self.cpu_only() {
            ProbeScope::CpuOnly
        } else {
            ProbeScope::All
        }
    }
}

/// One logical unit of work.
#[derive(Debug)]
pub struct ExecutionRequest<I> {
    pub utility: Utility,
    pub operation: Operation,
    pub input: Arc<I>,
    pub flag: BackendFlag,
}

impl<I> ExecutionRequest<I> {
    pub fn new(utility: Utility, operation: Operation, input: I, flag: BackendFlag) -> Self {
        Self {
            utility,
            operation,
            input: Arc::new(input),
            flag,
        }
    }
}

impl<I> Clone for ExecutionRequest<I> {
    fn clone(&self) -> Self {
        Self {
            utility: self.utility,
            operation: self.operation,
            input: Arc::clone(&self.input),
            flag: self.flag,
        }
    }
}

/// Ordered backends to try for one request. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    kinds: Vec<BackendKind>,
    forced: bool,
}

impl FallbackChain {
    /// A single backend with no fallback.
    pub fn forced(kind: BackendKind) -> Self {
        Self {
            kinds: vec![kind],
            forced: true,
        }
    }

    /// Preferred GPU kinds followed by CPU.
    pub fn with_fallback(gpus: Vec<BackendKind>) -> Self {
        let mut kinds: Vec<BackendKind> = gpus.into_iter().filter(|k| k.is_gpu()).collect();
        kinds.push(BackendKind::Cpu);
        Self {
            kinds,
            forced: false,
        }
    }

    pub fn kinds(&self) -> &[BackendKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// True when the chain came from an explicit single-backend flag.
    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

impl fmt::Display for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.kinds.iter().map(|k| k.name()).collect();
        f.write_str(&names.join(" -> "))
    }
}

/// Pure resolution policy over a configured preference list.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    preference: Preference,
}

impl Selector {
    pub fn new(preference: Preference) -> Self {
        Self { preference }
    }

    pub fn select<I, O>(
        &self,
        request: &ExecutionRequest<I>,
        caps: &CapabilitySet,
        registry: &KernelRegistry<I, O>,
    ) -> Result<FallbackChain, SelectError> {
        self.resolve(request.utility, request.operation, request.flag, caps, registry)
    }

    /// [`select`](Self::select) without a request value.
    pub fn resolve<I, O>(
        &self,
        utility: Utility,
        operation: Operation,
        flag: BackendFlag,
        caps: &CapabilitySet,
        registry: &KernelRegistry<I, O>,
    ) -> Result<FallbackChain, SelectError> {
        let kernels = registry
            .lookup(utility, operation)
            .ok_or(SelectError::UnknownOperation { utility, operation })?;

        if let Some(kind) = flag.explicit_override() {
            if kernels.get(kind).is_none() {
                return Err(SelectError::InvalidOverride {
                    backend: kind,
                    reason: format!(
                        "no {kind} kernel registered for {utility}/{operation}"
                    ),
                });
            }
            let cap = caps.get(kind);
            if !cap.available {
                return Err(SelectError::InvalidOverride {
                    backend: kind,
                    reason: format!(
                        "{kind} is unavailable: {}",
                        cap.reason.as_deref().unwrap_or("not detected")
                    ),
                });
            }
            return Ok(FallbackChain::forced(kind));
        }

        let gpus = self
            .preference
            .gpu_order()
            .iter()
            .copied()
            .filter(|&k| kernels.get(k).is_some() && caps.is_available(k))
            .collect();
        Ok(FallbackChain::with_fallback(gpus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KernelDescriptor;

    const OP: Operation = Operation("line-match");

    fn registry(kinds: &[BackendKind]) -> KernelRegistry<(), ()> {
        let mut b = KernelRegistry::builder();
        for &k in kinds {
            b.register(KernelDescriptor::new(Utility::Grep, OP, k, |_: &()| Ok(())));
        }
        b.build().unwrap()
    }

    fn req(flag: BackendFlag) -> ExecutionRequest<()> {
        ExecutionRequest::new(Utility::Grep, OP, (), flag)
    }

    use BackendKind::{Cpu, Metal, Vulkan};

    #[test]
    fn default_prefers_gpus_then_cpu() {
        let reg = registry(&[Cpu, Metal, Vulkan]);
        let caps = CapabilitySet::with_available(&[Metal, Vulkan]);
        let chain = Selector::default().select(&req(BackendFlag::Default), &caps, &reg).unwrap();
        assert_eq!(chain.kinds(), &[Metal, Vulkan, Cpu]);
        assert!(!chain.is_forced());
        let gpu = Selector::default().select(&req(BackendFlag::Gpu), &caps, &reg).unwrap();
        assert_eq!(gpu, chain);
        assert_eq!(chain.to_string(), "metal -> vulkan -> cpu");
    }

    #[test]
    fn preference_order_is_configurable() {
        let reg = registry(&[Cpu, Metal, Vulkan]);
        let caps = CapabilitySet::with_available(&[Metal, Vulkan]);
        let sel = Selector::new(Preference::new([Vulkan]));
        let chain = sel.select(&req(BackendFlag::Gpu), &caps, &reg).unwrap();
        assert_eq!(chain.kinds(), &[Vulkan, Metal, Cpu]);
    }

    #[test]
    fn unavailable_backends_are_skipped() {
        let reg = registry(&[Cpu, Metal, Vulkan]);
        let caps = CapabilitySet::with_available(&[Vulkan]);
        let chain = Selector::default().select(&req(BackendFlag::Default), &caps, &reg).unwrap();
        assert_eq!(chain.kinds(), &[Vulkan, Cpu]);
    }

    #[test]
    fn cpu_flag_is_always_cpu_only() {
        let reg = registry(&[Cpu, Metal, Vulkan]);
        let caps = CapabilitySet::with_available(&[Metal, Vulkan]);
        let chain = Selector::default().select(&req(BackendFlag::Cpu), &caps, &reg).unwrap();
        assert_eq!(chain.kinds(), &[Cpu]);
        assert!(chain.is_forced());
    }

    #[test]
    fn no_gpu_kernel_collapses_to_cpu() {
        let reg = registry(&[Cpu]);
        let caps = CapabilitySet::with_available(&[Metal, Vulkan]);
        for flag in [BackendFlag::Default, BackendFlag::Gpu] {
            let chain = Selector::default().select(&req(flag), &caps, &reg).unwrap();
            assert_eq!(chain.kinds(), &[Cpu]);
        }
        for (flag, kind) in [(BackendFlag::Metal, Metal), (BackendFlag::Vulkan, Vulkan)] {
            let err = Selector::default().select(&req(flag), &caps, &reg).unwrap_err();
            assert!(matches!(err, SelectError::InvalidOverride { backend, .. } if backend == kind));
        }
    }

    #[test]
    fn forced_unavailable_backend_is_invalid() {
        let reg = registry(&[Cpu, Metal, Vulkan]);
        let caps = CapabilitySet::with_available(&[Metal]);
        let err = Selector::default().select(&req(BackendFlag::Vulkan), &caps, &reg).unwrap_err();
        match err {
            SelectError::InvalidOverride { backend, reason } => {
                assert_eq!(backend, Vulkan);
                assert!(reason.contains("unavailable"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let chain = Selector::default().select(&req(BackendFlag::Metal), &caps, &reg).unwrap();
        assert_eq!(chain, FallbackChain::forced(Metal));
    }

    #[test]
    fn unknown_operation_is_reported() {
        let reg = registry(&[Cpu]);
        let caps = CapabilitySet::cpu_only("test");
        let request = ExecutionRequest::new(Utility::Sed, OP, (), BackendFlag::Default);
        assert!(matches!(
            Selector::default().select(&request, &caps, &reg),
            Err(SelectError::UnknownOperation { .. })
        ));
    }
}
