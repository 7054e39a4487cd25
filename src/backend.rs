//! Backend kinds and the per-process capability set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// One execution strategy for a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Metal,
    Vulkan,
}

impl BackendKind {
    /// Every kind, CPU first.
    pub const ALL: [BackendKind; 3] = [BackendKind::Cpu, BackendKind::Metal, BackendKind::Vulkan];

    /// The GPU kinds in their default preference order.
    pub const GPU: [BackendKind; 2] = [BackendKind::Metal, BackendKind::Vulkan];

    /// Stable lower-case name used on the command line and in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Metal => "metal",
            BackendKind::Vulkan => "vulkan",
        }
    }

    pub fn is_gpu(self) -> bool {
        self != BackendKind::Cpu
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(BackendKind::Cpu),
            "metal" => Ok(BackendKind::Metal),
            "vulkan" => Ok(BackendKind::Vulkan),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Parse a comma (or space) separated backend list such as `metal,vulkan`.
///
/// `none` and the empty string both yield an empty list.
pub fn parse_backend_list(raw: &str) -> Result<Vec<BackendKind>, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() || normalized == "none" {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in normalized.split([',', ';', ' ']).filter(|p| !p.is_empty()) {
        let kind = part.parse::<BackendKind>()?;
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    Ok(out)
}

/// Result of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapability {
    pub kind: BackendKind,
    pub available: bool,
    /// Human readable reason, set when `available` is false.
    pub reason: Option<String>,
    /// Name of the device found by the probe, when available.
    pub device: Option<String>,
    /// Seconds since the Unix epoch at which the probe finished.
    pub detected_at: u64,
}

impl BackendCapability {
    pub fn available(kind: BackendKind, device: impl Into<String>) -> Self {
        Self {
            kind,
            available: true,
            reason: None,
            device: Some(device.into()),
            detected_at: now_secs(),
        }
    }

    pub fn unavailable(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            available: false,
            reason: Some(reason.into()),
            device: None,
            detected_at: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Immutable capability snapshot for one process.
///
/// Holds exactly one entry per [`BackendKind`]. CPU is always available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    entries: Vec<BackendCapability>,
}

impl CapabilitySet {
    /// Build a set from probe results. Missing GPU kinds are recorded as
    /// unavailable and the CPU entry is forced available.
    pub fn new(results: impl IntoIterator<Item = BackendCapability>) -> Self {
        let mut entries: Vec<BackendCapability> = Vec::with_capacity(BackendKind::ALL.len());
        for cap in results {
            if cap.kind == BackendKind::Cpu && !cap.available {
                continue;
            }
            entries.retain(|e| e.kind != cap.kind);
            entries.push(cap);
        }
        for kind in BackendKind::ALL {
            if entries.iter().any(|e| e.kind == kind) {
                continue;
            }
            entries.push(if kind == BackendKind::Cpu {
                BackendCapability::available(kind, "host cpu")
            } else {
                BackendCapability::unavailable(kind, "not probed")
            });
        }
        entries.sort_by_key(|e| e.kind);
        Self { entries }
    }

    /// Capability set with only the CPU available.
    pub fn cpu_only(reason: &str) -> Self {
        Self::new(
            BackendKind::GPU
                .iter()
                .map(|&k| BackendCapability::unavailable(k, reason)),
        )
    }

    /// Capability set from a fixed list of available GPU kinds.
    pub fn with_available(kinds: &[BackendKind]) -> Self {
        Self::new(BackendKind::GPU.iter().map(|&k| {
            if kinds.contains(&k) {
                BackendCapability::available(k, format!("{k} device"))
            } else {
                BackendCapability::unavailable(k, format!("{k} not present"))
            }
        }))
    }

    pub fn get(&self, kind: BackendKind) -> &BackendCapability {
        // `new` guarantees one entry per kind, sorted by kind.
        &self.entries[kind as usize]
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.get(kind).available
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendCapability> {
        self.entries.iter()
    }
}
