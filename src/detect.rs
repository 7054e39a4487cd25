//! Capability detection for GPU compute backends.
//!
//! Detection runs once per process before any request is built. Probes run in
//! parallel on scoped threads; every probe finishes before [`Detector::detect`]
//! returns. A missing backend is data, never an error.

use sysinfo::{CpuExt, System, SystemExt};

use crate::backend::{BackendCapability, BackendKind, CapabilitySet};
use crate::config::RuntimeConfig;

/// Presence check for one GPU backend.
pub trait BackendProbe: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Minimal handshake. Returns the device name, or why the backend is
    /// unusable.
    fn probe(&self) -> Result<String, String>;
}

/// Which backends a run is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeScope {
    /// Probe every GPU backend.
    All,
    /// `--cpu`: no GPU probing at all.
    CpuOnly,
}

pub const NOT_PROBED_CPU: &str = "not probed (--cpu)";

/// Runs the probes and produces the immutable [`CapabilitySet`].
pub struct Detector {
    probes: Vec<Box<dyn BackendProbe>>,
}

impl Detector {
    pub fn new(probes: Vec<Box<dyn BackendProbe>>) -> Self {
        Self { probes }
    }

    /// Probes for the host, or a fixed answer when the configuration fakes
    /// the available set.
    pub fn system(config: &RuntimeConfig) -> Self {
        match &config.fake_backends {
            Some(fake) => Self::new(
                BackendKind::GPU
                    .iter()
                    .map(|&kind| {
                        Box::new(FixedProbe {
                            kind,
                            available: fake.contains(&kind),
                        }) as Box<dyn BackendProbe>
                    })
                    .collect(),
            ),
            None => Self::new(vec![Box::new(MetalProbe), Box::new(VulkanProbe)]),
        }
    }

    pub fn detect(&self, scope: ProbeScope) -> CapabilitySet {
        let cpu = cpu_capability();
        if scope == ProbeScope::CpuOnly {
            log::debug!("skipping gpu probes: cpu-only run");
            let mut caps: Vec<BackendCapability> = BackendKind::GPU
                .iter()
                .map(|&k| BackendCapability::unavailable(k, NOT_PROBED_CPU))
                .collect();
            caps.push(cpu);
            return CapabilitySet::new(caps);
        }

        let mut results = std::thread::scope(|s| {
            let handles: Vec<_> = self
                .probes
                .iter()
                .map(|probe| (probe.kind(), s.spawn(move || probe.probe())))
                .collect();
            handles
                .into_iter()
                .map(|(kind, handle)| {
                    let cap = match handle.join() {
                        Ok(Ok(device)) => BackendCapability::available(kind, device),
                        Ok(Err(reason)) => BackendCapability::unavailable(kind, reason),
                        Err(_) => BackendCapability::unavailable(kind, "probe panicked"),
                    };
                    match &cap.reason {
                        None => log::debug!("{kind}: available ({})", cap.device.as_deref().unwrap_or("?")),
                        Some(reason) => log::debug!("{kind}: unavailable ({reason})"),
                    }
                    cap
                })
                .collect::<Vec<_>>()
        });
        results.push(cpu);
        CapabilitySet::new(results)
    }
}

fn cpu_capability() -> BackendCapability {
    let mut sys = System::new();
    sys.refresh_cpu();
    let brand = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "host cpu".to_string());
    let threads = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    BackendCapability::available(BackendKind::Cpu, format!("{brand} ({threads} threads)"))
}

/// Probe with a predetermined answer.
pub struct FixedProbe {
    pub kind: BackendKind,
    pub available: bool,
}

impl BackendProbe for FixedProbe {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn probe(&self) -> Result<String, String> {
        if self.available {
            Ok(format!("fake {} device", self.kind))
        } else {
            Err(format!("{} disabled by {}", self.kind, crate::config::ENV_FAKE))
        }
    }
}

pub struct MetalProbe;

impl BackendProbe for MetalProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Metal
    }

    #[cfg(all(feature = "metal", target_os = "macos"))]
    fn probe(&self) -> Result<String, String> {
        metal::Device::system_default()
            .map(|device| device.name().to_string())
            .ok_or_else(|| "no Metal device".to_string())
    }

    #[cfg(all(not(feature = "metal"), target_os = "macos"))]
    fn probe(&self) -> Result<String, String> {
        let out = command_output("system_profiler", &["SPDisplaysDataType"])?;
        parse_system_profiler(&out)
    }

    #[cfg(not(target_os = "macos"))]
    fn probe(&self) -> Result<String, String> {
        Err("Metal is only available on macOS".to_string())
    }
}

pub struct VulkanProbe;

impl BackendProbe for VulkanProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    #[cfg(feature = "vulkan")]
    fn probe(&self) -> Result<String, String> {
        // SAFETY: loads the Vulkan loader dynamically; only presence is inspected.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| format!("no Vulkan loader: {e}"))?;
        let app_info =
            ash::vk::ApplicationInfo::default().api_version(ash::vk::make_api_version(0, 1, 0, 0));
        let create_info = ash::vk::InstanceCreateInfo::default().application_info(&app_info);
        // SAFETY: create_info points to stack-local data for the duration of the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| format!("vkCreateInstance failed: {e}"))?;
        // SAFETY: valid instance handle.
        let names = unsafe { instance.enumerate_physical_devices() }.map(|devices| {
            devices
                .into_iter()
                .filter_map(|pd| {
                    // SAFETY: pd was returned by this instance.
                    let props = unsafe { instance.get_physical_device_properties(pd) };
                    props
                        .device_name_as_c_str()
                        .ok()
                        .map(|n| n.to_string_lossy().into_owned())
                })
                .collect::<Vec<_>>()
        });
        // SAFETY: valid instance, no further use after destroy.
        unsafe { instance.destroy_instance(None) };
        let names = names.map_err(|e| format!("device enumeration failed: {e}"))?;
        pick_vulkan_device(names)
    }

    #[cfg(not(feature = "vulkan"))]
    fn probe(&self) -> Result<String, String> {
        let out = command_output("vulkaninfo", &["--summary"])?;
        parse_vulkaninfo(&out)
    }
}

#[cfg(any(not(feature = "vulkan"), all(target_os = "macos", not(feature = "metal"))))]
fn command_output(cmd: &str, args: &[&str]) -> Result<String, String> {
    use std::process::{Command, Stdio};

    let output = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| format!("{cmd} not runnable: {e}"))?;
    if !output.status.success() {
        return Err(format!("{cmd} exited with {}", output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pull the first `deviceName` out of `vulkaninfo --summary`.
pub fn parse_vulkaninfo(text: &str) -> Result<String, String> {
    let names = text
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == "deviceName").then(|| value.trim().to_string())
        })
        .collect();
    pick_vulkan_device(names)
}

fn pick_vulkan_device(names: Vec<String>) -> Result<String, String> {
    if names.is_empty() {
        return Err("no Vulkan physical devices".to_string());
    }
    names
        .iter()
        .find(|n| !is_software_rasterizer(n))
        .cloned()
        .ok_or_else(|| format!("only software devices found ({})", names.join(", ")))
}

fn is_software_rasterizer(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("llvmpipe") || lower.contains("swiftshader") || lower.contains("lavapipe")
}

/// Find a Metal capable chipset in `system_profiler SPDisplaysDataType`.
pub fn parse_system_profiler(text: &str) -> Result<String, String> {
    let mut chipset = None;
    for line in text.lines().map(str::trim) {
        if let Some(model) = line.strip_prefix("Chipset Model:") {
            chipset = Some(model.trim().to_string());
        } else if line.starts_with("Metal") {
            let supported = line
                .split_once(':')
                .map(|(_, v)| !v.trim().eq_ignore_ascii_case("not supported"))
                .unwrap_or(false);
            if supported {
                return Ok(chipset.unwrap_or_else(|| "Metal device".to_string()));
            }
        }
    }
    Err("no Metal capable display adapter".to_string())
}
