use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{parse_backend_list, BackendKind};
use crate::error::ConfigError;

pub const ENV_PREFER: &str = "GPU_UTILS_PREFER";
pub const ENV_TIMEOUT: &str = "GPU_UTILS_KERNEL_TIMEOUT_MS";
pub const ENV_CONFIG: &str = "GPU_UTILS_CONFIG";
pub const ENV_FAKE: &str = "GPU_UTILS_FAKE_BACKENDS";
pub const ENV_FAIL: &str = "GPU_UTILS_FAIL_BACKENDS";
pub const ENV_STRICT: &str = "GPU_UTILS_STRICT";

/// Ordered GPU preference. CPU is always implicitly last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preference(Vec<BackendKind>);

impl Preference {
    /// Normalise a user list: drop CPU and duplicates, append missing GPU
    /// kinds in default order.
    pub fn new(kinds: impl IntoIterator<Item = BackendKind>) -> Self {
        let mut order = Vec::new();
        for kind in kinds {
            if kind.is_gpu() && !order.contains(&kind) {
                order.push(kind);
            }
        }
        for kind in BackendKind::GPU {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        Self(order)
    }

    pub fn gpu_order(&self) -> &[BackendKind] {
        &self.0
    }
}

impl Default for Preference {
    fn default() -> Self {
        Self::new(BackendKind::GPU)
    }
}

/// Runtime configuration for the backend layer.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Order in which GPU backends are tried.
    pub preference: Preference,
    /// Per-kernel timeout for GPU kernels. `None` waits indefinitely.
    pub kernel_timeout: Option<Duration>,
    /// Replaces hardware probing with a fixed set of available GPU kinds.
    pub fake_backends: Option<Vec<BackendKind>>,
    /// Kinds whose kernel attempts fail without running.
    pub fail_backends: HashSet<BackendKind>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preference: Preference::default(),
            kernel_timeout: None,
            fake_backends: None,
            fail_backends: HashSet::new(),
        }
    }
}

/// On-disk representation, all keys optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    prefer: Option<Vec<BackendKind>>,
    kernel_timeout_ms: Option<u64>,
    fake_backends: Option<Vec<BackendKind>>,
    fail_backends: Option<Vec<BackendKind>>,
}

impl RuntimeConfig {
    /// Defaults, then `GPU_UTILS_CONFIG`, then the individual variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(path) = lookup(ENV_CONFIG).filter(|p| !p.is_empty()) {
            cfg.apply_file(Path::new(&path))?;
        }

        if let Some(raw) = lookup(ENV_PREFER) {
            cfg.preference = Preference::new(list(ENV_PREFER, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_TIMEOUT.into(),
                msg: format!("'{raw}' is not a number of milliseconds"),
            })?;
            cfg.kernel_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        let strict = lookup(ENV_STRICT)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if strict {
            cfg.fake_backends = None;
            cfg.fail_backends.clear();
            return Ok(cfg);
        }
        if let Some(raw) = lookup(ENV_FAKE) {
            cfg.fake_backends = Some(list(ENV_FAKE, &raw)?);
        }
        if let Some(raw) = lookup(ENV_FAIL) {
            cfg.fail_backends = list(ENV_FAIL, &raw)?.into_iter().collect();
        }
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(prefer) = file.prefer {
            self.preference = Preference::new(prefer);
        }
        if let Some(ms) = file.kernel_timeout_ms {
            self.kernel_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if file.fake_backends.is_some() {
            self.fake_backends = file.fake_backends;
        }
        if let Some(fail) = file.fail_backends {
            self.fail_backends = fail.into_iter().collect();
        }
        Ok(())
    }
}

fn list(key: &str, raw: &str) -> Result<Vec<BackendKind>, ConfigError> {
    parse_backend_list(raw).map_err(|msg| ConfigError::Invalid {
        key: key.into(),
        msg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_prefer_metal_then_vulkan() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(
            cfg.preference.gpu_order(),
            &[BackendKind::Metal, BackendKind::Vulkan]
        );
        assert_eq!(cfg.kernel_timeout, None);
        assert!(cfg.fake_backends.is_none());
    }

    #[test]
    fn env_overrides_preference_and_timeout() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            (ENV_PREFER, "vulkan"),
            (ENV_TIMEOUT, "250"),
            (ENV_FAKE, "metal,vulkan"),
            (ENV_FAIL, "metal"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.preference.gpu_order(),
            &[BackendKind::Vulkan, BackendKind::Metal]
        );
        assert_eq!(cfg.kernel_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            cfg.fake_backends,
            Some(vec![BackendKind::Metal, BackendKind::Vulkan])
        );
        assert!(cfg.fail_backends.contains(&BackendKind::Metal));
    }

    #[test]
    fn strict_mode_ignores_test_overrides() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            (ENV_FAKE, "none"),
            (ENV_FAIL, "cpu"),
            (ENV_STRICT, "1"),
        ]))
        .unwrap();
        assert!(cfg.fake_backends.is_none());
        assert!(cfg.fail_backends.is_empty());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(RuntimeConfig::from_lookup(lookup(&[(ENV_PREFER, "cuda")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(ENV_TIMEOUT, "soon")])).is_err());
    }

    #[test]
    fn reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpu-utils.json");
        std::fs::write(
            &path,
            r#"{"prefer": ["vulkan"], "kernel_timeout_ms": 1000}"#,
        )
        .unwrap();
        let cfg = RuntimeConfig::from_lookup(lookup(&[(ENV_CONFIG, path.to_str().unwrap())]))
            .unwrap();
        assert_eq!(cfg.preference.gpu_order()[0], BackendKind::Vulkan);
        assert_eq!(cfg.kernel_timeout, Some(Duration::from_secs(1)));
    }
}
