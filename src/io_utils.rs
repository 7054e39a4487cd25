use std::fmt;
use std::io;
use std::path::Path;

use crate::error::{BackendError, ConfigError};

/// Error reported by a frontend, with the exit code it maps to.
#[derive(Debug)]
pub struct CliError {
    pub msg: String,
    pub code: i32,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.msg.fmt(f)
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Format a user friendly I/O error message with suggestions.
pub fn format_io_error(operation: &str, path: &Path, err: &io::Error) -> String {
    use io::ErrorKind::*;
    let suggestion = match err.kind() {
        NotFound => "Check that the file exists and the path is correct.",
        PermissionDenied => "Check permissions or run as a different user.",
        UnexpectedEof => "File appears truncated.",
        _ => "Check the path and try again.",
    };
    format!(
        "error {} '{}': {}. {}",
        operation,
        path.display(),
        err,
        suggestion
    )
}

/// Convert an I/O error into a CLI error with context.
pub fn io_cli_error(operation: &str, path: &Path, err: io::Error, code: i32) -> CliError {
    CliError {
        msg: format_io_error(operation, path, &err),
        code,
        source: Some(Box::new(err)),
    }
}

/// Simple CLI error from string.
pub fn simple_cli_error(msg: &str, code: i32) -> CliError {
    CliError {
        msg: msg.to_string(),
        code,
        source: None,
    }
}

/// Configuration errors are usage errors of the tool.
pub fn config_cli_error(err: ConfigError, code: i32) -> CliError {
    CliError {
        msg: format!("{err}. Check the GPU_UTILS_* environment variables."),
        code,
        source: Some(Box::new(err)),
    }
}

/// Map a backend condition to its exit code. CPU kernel failures are domain
/// errors and take `domain_code`.
pub fn backend_cli_error(err: BackendError, domain_code: i32) -> CliError {
    let code = err.exit_code().unwrap_or(domain_code);
    CliError {
        msg: format!("{err}{}", cli_hint(&err)),
        code,
        source: Some(Box::new(err)),
    }
}

/// Return an actionable hint for a backend error variant.
pub fn cli_hint(err: &BackendError) -> &'static str {
    match err {
        BackendError::InvalidOverride { .. } => " hint=\"run with --list-backends or drop the flag\"",
        BackendError::ForcedBackendFailed { .. } => " hint=\"retry with --gpu to allow fallback\"",
        BackendError::ExhaustedFallback { .. } => " hint=\"retry with --cpu\"",
        BackendError::Registry(_) | BackendError::Unavailable(_) | BackendError::Select(_) => {
            " hint=\"this is a packaging bug\""
        }
        BackendError::CpuKernelFailed(_) | BackendError::Interrupted { .. } => "",
    }
}
