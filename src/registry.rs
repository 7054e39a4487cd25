//! Kernel table: (utility, operation) to one kernel per backend.
//!
//! Tables are assembled with a [`RegistryBuilder`] during init and frozen by
//! [`RegistryBuilder::build`]. A built [`KernelRegistry`] has no mutation API,
//! so lookups from worker threads need no locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::BackendKind;
use crate::error::{KernelError, RegistryError};

/// The four tools sharing the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Utility {
    Find,
    Grep,
    Sed,
    Gawk,
}

impl Utility {
    pub fn name(self) -> &'static str {
        match self {
            Utility::Find => "find",
            Utility::Grep => "grep",
            Utility::Sed => "sed",
            Utility::Gawk => "gawk",
        }
    }
}

impl fmt::Display for Utility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical operation id, e.g. `line-match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Operation(pub &'static str);

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Kernel entry point.
pub type KernelFn<I, O> = dyn Fn(&I) -> Result<O, KernelError> + Send + Sync;

/// One (utility, operation, backend) triple and its entry point.
pub struct KernelDescriptor<I, O> {
    pub utility: Utility,
    pub operation: Operation,
    pub backend: BackendKind,
    entry: Arc<KernelFn<I, O>>,
}

impl<I, O> KernelDescriptor<I, O> {
    pub fn new<F>(utility: Utility, operation: Operation, backend: BackendKind, entry: F) -> Self
    where
        F: Fn(&I) -> Result<O, KernelError> + Send + Sync + 'static,
    {
        Self {
            utility,
            operation,
            backend,
            entry: Arc::new(entry),
        }
    }

    /// Run the kernel on the calling thread.
    pub fn invoke(&self, input: &I) -> Result<O, KernelError> {
        (*self.entry)(input)
    }

    /// Shared handle to the entry point, for dispatch on another thread.
    pub fn entry(&self) -> Arc<KernelFn<I, O>> {
        Arc::clone(&self.entry)
    }
}

impl<I, O> fmt::Debug for KernelDescriptor<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("utility", &self.utility)
            .field("operation", &self.operation)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Kernels registered for one (utility, operation), ordered CPU, Metal, Vulkan.
pub struct KernelSet<I, O> {
    kernels: Vec<KernelDescriptor<I, O>>,
}

impl<I, O> KernelSet<I, O> {
    pub fn get(&self, kind: BackendKind) -> Option<&KernelDescriptor<I, O>> {
        self.kernels.iter().find(|k| k.backend == kind)
    }

    pub fn backends(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.kernels.iter().map(|k| k.backend)
    }

    pub fn has_gpu(&self) -> bool {
        self.kernels.iter().any(|k| k.backend.is_gpu())
    }
}

/// Mutable staging area for kernel registration.
pub struct RegistryBuilder<I, O> {
    pending: Vec<KernelDescriptor<I, O>>,
}

impl<I, O> Default for RegistryBuilder<I, O> {
    fn default() -> Self {
        Self { pending: Vec::new() }
    }
}

impl<I, O> RegistryBuilder<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: KernelDescriptor<I, O>) -> &mut Self {
        self.pending.push(descriptor);
        self
    }

    /// Freeze the table. Fails if any (utility, operation) lacks a CPU kernel
    /// or has two kernels for the same backend.
    pub fn build(self) -> Result<KernelRegistry<I, O>, RegistryError> {
        let mut table: BTreeMap<(Utility, Operation), Vec<KernelDescriptor<I, O>>> =
            BTreeMap::new();
        for desc in self.pending {
            let slot = table.entry((desc.utility, desc.operation)).or_default();
            if slot.iter().any(|k| k.backend == desc.backend) {
                return Err(RegistryError::DuplicateKernel {
                    utility: desc.utility,
                    operation: desc.operation,
                    backend: desc.backend,
                });
            }
            slot.push(desc);
        }

        let mut entries = BTreeMap::new();
        for ((utility, operation), mut kernels) in table {
            if !kernels.iter().any(|k| k.backend == BackendKind::Cpu) {
                return Err(RegistryError::MissingCpuKernel { utility, operation });
            }
            kernels.sort_by_key(|k| k.backend);
            log::debug!(
                "registered {utility}/{operation}: {}",
                kernels
                    .iter()
                    .map(|k| k.backend.name())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            entries.insert((utility, operation), KernelSet { kernels });
        }
        Ok(KernelRegistry { entries })
    }
}

/// Frozen kernel table.
pub struct KernelRegistry<I, O> {
    entries: BTreeMap<(Utility, Operation), KernelSet<I, O>>,
}

impl<I, O> KernelRegistry<I, O> {
    pub fn builder() -> RegistryBuilder<I, O> {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, utility: Utility, operation: Operation) -> Option<&KernelSet<I, O>> {
        self.entries.get(&(utility, operation))
    }

    pub fn operations(&self) -> impl Iterator<Item = (Utility, Operation)> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP: Operation = Operation("line-match");

    fn kernel(backend: BackendKind) -> KernelDescriptor<u32, u32> {
        KernelDescriptor::new(Utility::Grep, OP, backend, |x: &u32| Ok(x + 1))
    }

    #[test]
    fn missing_cpu_kernel_is_fatal() {
        let mut b = KernelRegistry::builder();
        b.register(kernel(BackendKind::Metal));
        let err = b.build().err().unwrap();
        assert_eq!(
            err,
            RegistryError::MissingCpuKernel {
                utility: Utility::Grep,
                operation: OP
            }
        );
    }

    #[test]
    fn duplicate_kernel_is_rejected() {
        let mut b = KernelRegistry::builder();
        b.register(kernel(BackendKind::Cpu)).register(kernel(BackendKind::Cpu));
        assert!(matches!(
            b.build(),
            Err(RegistryError::DuplicateKernel { backend: BackendKind::Cpu, .. })
        ));
    }

    #[test]
    fn lookup_orders_cpu_first() {
        let mut b = KernelRegistry::builder();
        b.register(kernel(BackendKind::Vulkan))
            .register(kernel(BackendKind::Cpu))
            .register(kernel(BackendKind::Metal));
        let reg = b.build().unwrap();
        let set = reg.lookup(Utility::Grep, OP).unwrap();
        assert_eq!(
            set.backends().collect::<Vec<_>>(),
            vec![BackendKind::Cpu, BackendKind::Metal, BackendKind::Vulkan]
        );
        assert!(set.has_gpu());
        assert_eq!(set.get(BackendKind::Metal).unwrap().invoke(&1).unwrap(), 2);
        assert!(reg.lookup(Utility::Sed, OP).is_none());
    }
}
