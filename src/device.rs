//! Compute device handles for GPU backends.
//!
//! A [`ComputeDevice`] is opened for each backend the detector reported
//! available and is handed to kernel registration; frontends never see it.
//! Work is submitted as a grid of tiles to the device's own worker queue.
//! Submission returns only once every tile finished, so a kernel never hands
//! back a partially computed result. Callers may submit from any thread,
//! including workers of another rayon pool.

use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use crate::backend::{BackendKind, CapabilitySet};
use crate::error::KernelError;
use crate::exec::Cancellation;
use crate::tile::TileMap;

/// Per-device dispatch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest input (in items) a single dispatch accepts.
    pub max_buffer_len: usize,
    /// Items processed by one work group.
    pub tile_len: usize,
}

impl DeviceLimits {
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Metal => Self {
                max_buffer_len: 256 << 20,
                tile_len: 4096,
            },
            BackendKind::Vulkan => Self {
                max_buffer_len: 128 << 20,
                tile_len: 4096,
            },
            BackendKind::Cpu => Self {
                max_buffer_len: usize::MAX,
                tile_len: 4096,
            },
        }
    }
}

pub struct ComputeDevice {
    kind: BackendKind,
    name: String,
    limits: DeviceLimits,
    /// Device queue. `None` when no worker could be started; tiles then run
    /// on the submitting thread.
    queue: Option<rayon::ThreadPool>,
    cancel: Cancellation,
}

impl ComputeDevice {
    pub fn new(kind: BackendKind, name: impl Into<String>, limits: DeviceLimits) -> Self {
        let name = name.into();
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let queue = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |idx| format!("{kind}-queue-{idx}"))
            .build();
        let queue = match queue {
            Ok(pool) => Some(pool),
            Err(e) => {
                log::warn!("{kind}: no device queue for {name} ({e}), dispatching inline");
                None
            }
        };
        Self {
            kind,
            name,
            limits,
            queue,
            cancel: Cancellation::default(),
        }
    }

    /// Stop dispatching tiles once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Run `work` once per tile of a `len` item buffer and gather the results
    /// in tile order. Each call sees the tile's owned range and its visible
    /// range (owned plus `overlap`).
    pub fn dispatch<R, F>(&self, len: usize, overlap: usize, work: F) -> Result<Vec<R>, KernelError>
    where
        R: Send,
        F: Fn(Range<usize>, Range<usize>) -> R + Sync,
    {
        self.check_len(len)?;
        let map = TileMap::new(len, self.limits.tile_len, overlap);
        let results = self.submit(map.tile_count(), |tile| work(map.owned(tile), map.visible(tile)));
        self.collect(results)
    }

    /// Run `work` once per precomputed range, results in range order.
    pub fn dispatch_ranges<R, F>(&self, ranges: &[Range<usize>], work: F) -> Result<Vec<R>, KernelError>
    where
        R: Send,
        F: Fn(Range<usize>) -> R + Sync,
    {
        self.check_len(ranges.last().map(|r| r.end).unwrap_or(0))?;
        let results = self.submit(ranges.len(), |i| work(ranges[i].clone()));
        self.collect(results)
    }

    fn check_len(&self, len: usize) -> Result<(), KernelError> {
        if len > self.limits.max_buffer_len {
            return Err(KernelError::UnsupportedInput(format!(
                "{len} items exceed the {} buffer limit of {} on {}",
                self.kind, self.limits.max_buffer_len, self.name
            )));
        }
        Ok(())
    }

    /// Execute `tiles` work items on the device queue. Tiles that start after
    /// cancellation are skipped and come back as `None`.
    fn submit<R, F>(&self, tiles: usize, work: F) -> Vec<Option<R>>
    where
        R: Send,
        F: Fn(usize) -> R + Sync,
    {
        let run = |tile: usize| (!self.cancel.is_cancelled()).then(|| work(tile));
        match &self.queue {
            Some(pool) => pool.install(|| (0..tiles).into_par_iter().map(run).collect()),
            None => (0..tiles).map(run).collect(),
        }
    }

    fn collect<R>(&self, results: Vec<Option<R>>) -> Result<Vec<R>, KernelError> {
        if self.cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        results
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or(KernelError::Cancelled)
    }
}

/// Devices opened for one process, at most one per GPU kind.
#[derive(Default, Clone)]
pub struct DeviceSet {
    devices: Vec<Arc<ComputeDevice>>,
}

impl DeviceSet {
    /// Open a device for every available GPU backend. Every device stops
    /// dispatching once `cancel` fires.
    pub fn open(caps: &CapabilitySet, cancel: &Cancellation) -> Self {
        let devices = BackendKind::GPU
            .iter()
            .map(|&kind| caps.get(kind))
            .filter(|cap| cap.available)
            .map(|cap| {
                let name = cap.device.clone().unwrap_or_else(|| cap.kind.to_string());
                let device = ComputeDevice::new(cap.kind, name, DeviceLimits::for_kind(cap.kind));
                Arc::new(device.with_cancellation(cancel.clone()))
            })
            .collect();
        Self { devices }
    }

    pub fn from_devices(devices: Vec<ComputeDevice>) -> Self {
        Self {
            devices: devices.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<ComputeDevice>> {
        self.devices.iter().find(|d| d.kind == kind).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ComputeDevice>> {
        self.devices.iter()
    }
}
