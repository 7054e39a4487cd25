use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;

use gpu_utils::cli::{init_runtime, print_backends, report, CommonArgs};
use gpu_utils::io_utils::{backend_cli_error, simple_cli_error, CliError};
use gpu_utils::kernels::find::{self, entry_type, Entry, Expression, Input, Output, ENTRY_FILTER};
use gpu_utils::{logging, BackendError, BackendRuntime, Utility};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;

/// Entries handed to one kernel call.
const BATCH: usize = 4096;

/// Flags clap owns; everything else belongs to the expression.
const RUNTIME_FLAGS: [&str; 5] = ["--gpu", "--metal", "--vulkan", "--cpu", "--list-backends"];

/// Tests whose next argument is their value, never a runtime flag.
const VALUE_TESTS: [&str; 5] = ["-name", "-iname", "-type", "-maxdepth", "-mindepth"];

/// Search for files in a directory hierarchy.
#[derive(Parser)]
#[command(name = "find", version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,
    /// Starting points, then the expression (-name, -iname, -type, -maxdepth, -mindepth, -print)
    #[arg(
        value_name = "PATH | EXPRESSION",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    args: Vec<String>,
}

fn main() {
    logging::init("find");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report("find", &e);
            std::process::exit(e.code);
        }
    }
}

/// Move runtime flags ahead of the starting points so they may appear
/// anywhere on the command line. The value of a test like `-name` stays put
/// even when it spells a runtime flag.
fn hoist_runtime_flags(argv: Vec<String>) -> Vec<String> {
    let mut iter = argv.into_iter();
    let mut out: Vec<String> = iter.next().into_iter().collect();
    let mut rest = Vec::new();
    let mut takes_value = false;
    for arg in iter {
        if !takes_value && RUNTIME_FLAGS.contains(&arg.as_str()) {
            out.push(arg);
            continue;
        }
        takes_value = !takes_value && VALUE_TESTS.contains(&arg.as_str());
        rest.push(arg);
    }
    out.extend(rest);
    out
}

fn run() -> Result<i32, CliError> {
    let args = Args::parse_from(hoist_runtime_flags(std::env::args().collect()));
    let (paths, expr) = Expression::parse(&args.args)
        .map_err(|e| simple_cli_error(&e.to_string(), EXIT_FAILURE))?;

    let runtime: BackendRuntime<Input, Output> =
        init_runtime(Utility::Find, &args.common, EXIT_FAILURE, |builder, devices| {
            find::register(builder, &expr, devices)
        })?;
    if args.common.list_backends {
        print_backends(&runtime)?;
        return Ok(EXIT_OK);
    }

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let mut status = EXIT_OK;
    for root in &paths {
        let walker = walkdir::WalkDir::new(root)
            .follow_links(false)
            .min_depth(expr.min_depth)
            .max_depth(expr.max_depth.unwrap_or(usize::MAX))
            .sort_by_file_name();

        let mut batch = Vec::with_capacity(BATCH);
        for item in walker {
            match item {
                Ok(e) => batch.push(Entry {
                    file_type: entry_type(e.file_type()),
                    depth: e.depth(),
                    path: e.into_path(),
                }),
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_else(|| root.clone());
                    let reason = e
                        .io_error()
                        .map(|io| io.to_string())
                        .unwrap_or_else(|| e.to_string());
                    eprintln!("find: '{path}': {reason}");
                    status = EXIT_FAILURE;
                }
            }
            if batch.len() == BATCH {
                emit(&runtime, std::mem::take(&mut batch), &mut out)?;
            }
        }
        if !batch.is_empty() {
            emit(&runtime, batch, &mut out)?;
        }
    }
    out.flush()
        .map_err(|e| simple_cli_error(&format!("write error: {e}"), EXIT_FAILURE))?;
    Ok(status)
}

fn emit<W: Write>(runtime: &BackendRuntime<Input, Output>, batch: Vec<Entry>, out: &mut W) -> Result<(), CliError> {
    if runtime.cancellation().is_cancelled() {
        return Err(backend_cli_error(interrupted(), EXIT_FAILURE));
    }
    let entries: Input = Arc::from(batch);
    let done = runtime
        .run(ENTRY_FILTER, Arc::clone(&entries))
        .map_err(|e| backend_cli_error(e, EXIT_FAILURE))?;
    log::debug!("batch of {} entries on {}", entries.len(), done.backend);
    for &i in &done.output {
        if let Some(entry) = entries.get(i) {
            writeln!(out, "{}", entry.path.display())
                .map_err(|e| simple_cli_error(&format!("write error: {e}"), EXIT_FAILURE))?;
        }
    }
    Ok(())
}

fn interrupted() -> BackendError {
    BackendError::Interrupted { attempted: Vec::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_flags_move_to_front() {
        let argv = ["find", ".", "-name", "*.rs", "--cpu"].map(String::from).to_vec();
        assert_eq!(
            hoist_runtime_flags(argv),
            ["find", "--cpu", ".", "-name", "*.rs"].map(String::from).to_vec()
        );
    }

    #[test]
    fn test_values_are_never_hoisted() {
        let argv = ["find", ".", "-name", "--cpu", "--vulkan"].map(String::from).to_vec();
        let hoisted = hoist_runtime_flags(argv);
        assert_eq!(
            hoisted,
            ["find", "--vulkan", ".", "-name", "--cpu"].map(String::from).to_vec()
        );

        let args = Args::parse_from(hoisted);
        assert!(args.common.backend.vulkan);
        assert!(!args.common.backend.cpu);
        let (paths, _) = Expression::parse(&args.args).unwrap();
        assert_eq!(paths, vec![".".to_string()]);
    }

    #[test]
    fn type_value_spelled_like_a_flag_stays() {
        let argv = ["find", "-type", "--gpu", "x"].map(String::from).to_vec();
        assert_eq!(
            hoist_runtime_flags(argv),
            ["find", "-type", "--gpu", "x"].map(String::from).to_vec()
        );
    }
}
