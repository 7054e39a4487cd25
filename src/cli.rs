//! Command line pieces shared by the four frontends.

use std::io::Write;

use clap::Args;

use crate::config::RuntimeConfig;
use crate::detect::Detector;
use crate::device::DeviceSet;
use crate::error::{EXIT_INTERRUPTED, EXIT_INVALID_OVERRIDE};
use crate::exec::Cancellation;
use crate::io_utils::{backend_cli_error, config_cli_error, simple_cli_error, CliError};
use crate::registry::{RegistryBuilder, Utility};
use crate::runtime::BackendRuntime;
use crate::select::BackendFlag;

/// `--gpu | --metal | --vulkan | --cpu`, at most one.
#[derive(Args, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[group(id = "backend", multiple = false)]
pub struct BackendArgs {
    /// Prefer any available GPU backend, fall back to CPU (default)
    #[arg(long)]
    pub gpu: bool,
    /// Force the Metal backend; fail instead of falling back
    #[arg(long)]
    pub metal: bool,
    /// Force the Vulkan backend; fail instead of falling back
    #[arg(long)]
    pub vulkan: bool,
    /// Force the CPU path; no GPU probing is performed
    #[arg(long)]
    pub cpu: bool,
}

impl BackendArgs {
    pub fn flag(&self) -> BackendFlag {
        if self.cpu {
            BackendFlag::Cpu
        } else if self.metal {
            BackendFlag::Metal
        } else if self.vulkan {
            BackendFlag::Vulkan
        } else if self.gpu {
            BackendFlag::Gpu
        } else {
            BackendFlag::Default
        }
    }
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct CommonArgs {
    #[command(flatten)]
    pub backend: BackendArgs,
    /// Print detected compute backends as JSON and exit
    #[arg(long)]
    pub list_backends: bool,
}

/// Build the runtime for one tool from the environment.
///
/// Configuration problems exit with `usage_code`; registry defects with the
/// dedicated registry code. SIGINT cancels the runtime from here on.
pub fn init_runtime<I, O, F>(
    utility: Utility,
    common: &CommonArgs,
    usage_code: i32,
    register: F,
) -> Result<BackendRuntime<I, O>, CliError>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    F: FnOnce(&mut RegistryBuilder<I, O>, &DeviceSet),
{
    let config = RuntimeConfig::from_env().map_err(|e| config_cli_error(e, usage_code))?;
    let detector = Detector::system(&config);
    let runtime = BackendRuntime::init(utility, common.backend.flag(), &config, &detector, register)
        .map_err(|e| backend_cli_error(e, usage_code))?;
    watch_interrupts(utility, runtime.cancellation().clone());
    Ok(runtime)
}

/// First Ctrl-C cancels outstanding work, the second one exits at once.
fn watch_interrupts(utility: Utility, cancel: Cancellation) {
    let spawned = std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    log::warn!("{utility}: cannot watch for interrupts: {e}");
                    return;
                }
            };
            rt.block_on(async {
                loop {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::warn!("{utility}: cannot watch for interrupts: {e}");
                        return;
                    }
                    if cancel.is_cancelled() {
                        std::process::exit(EXIT_INTERRUPTED);
                    }
                    log::info!("{utility}: interrupt received, stopping");
                    cancel.cancel();
                }
            });
        });
    if let Err(e) = spawned {
        log::warn!("{utility}: cannot watch for interrupts: {e}");
    }
}

/// `--list-backends`: dump the capability set to stdout.
pub fn print_backends<I, O>(runtime: &BackendRuntime<I, O>) -> Result<(), CliError>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    let json = serde_json::json!({
        "utility": runtime.utility(),
        "backends": runtime.capabilities(),
    });
    let text = serde_json::to_string_pretty(&json)
        .map_err(|e| simple_cli_error(&format!("cannot render backends: {e}"), 2))?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{text}").map_err(|e| simple_cli_error(&format!("write failed: {e}"), 2))
}

/// Print a terminal error to stderr. Backend conditions keep their
/// structured `key=value` form; the log level never silences either kind.
pub fn report(tool: &str, err: &CliError) {
    let line = render_error(tool, err);
    eprintln!("{line}");
    if let Some(source) = std::error::Error::source(err) {
        log::debug!("{tool}: exit {} caused by {source:?}", err.code);
    }
}

fn render_error(tool: &str, err: &CliError) -> String {
    if err.code >= EXIT_INVALID_OVERRIDE {
        format!("{tool}: ERROR {err}")
    } else {
        format!("{tool}: {err}")
    }
}
