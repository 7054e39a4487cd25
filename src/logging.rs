use std::io::Write;

/// Variable holding the log filter, `env_logger` syntax.
pub const ENV_LOG: &str = "GPU_UTILS_LOG";

/// Route `log` records to stderr as `<tool>: <LEVEL> <message>`.
///
/// Default level is `warn`, so fallback transitions are always visible and
/// stdout is never touched.
pub fn init(tool: &'static str) {
    let env = env_logger::Env::new().filter_or(ENV_LOG, "warn");
    let _ = env_logger::Builder::from_env(env)
        .format(move |buf, record| writeln!(buf, "{tool}: {} {}", record.level(), record.args()))
        .target(env_logger::Target::Stderr)
        .try_init();
}
