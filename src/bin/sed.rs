use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use gpu_utils::cli::{init_runtime, print_backends, report, CommonArgs};
use gpu_utils::io_utils::{backend_cli_error, io_cli_error, simple_cli_error, CliError};
use gpu_utils::kernels::join_inputs;
use gpu_utils::kernels::sed::{self, Input, Output, Script, STREAM_EDIT};
use gpu_utils::{logging, BackendError, BackendRuntime, Utility};

const EXIT_OK: i32 = 0;
const EXIT_BAD_SCRIPT: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;

/// Stream editor for filtering and transforming text.
#[derive(Parser)]
#[command(name = "sed", version)]
struct Args {
    /// Suppress automatic printing of pattern space
    #[arg(short = 'n', long = "quiet", alias = "silent")]
    quiet: bool,
    /// Use extended regular expressions in the script
    #[arg(short = 'E', long = "regexp-extended", short_alias = 'r')]
    extended: bool,
    /// Add the script to the commands to be executed
    #[arg(short = 'e', long = "expression", value_name = "SCRIPT")]
    expressions: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
    /// SCRIPT (unless -e is given) followed by input FILEs
    #[arg(value_name = "SCRIPT | FILE")]
    args: Vec<String>,
}

fn main() {
    logging::init("sed");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report("sed", &e);
            std::process::exit(e.code);
        }
    }
}

fn run() -> Result<i32, CliError> {
    let mut args = Args::parse();
    let source = if !args.expressions.is_empty() {
        args.expressions.join("\n")
    } else if !args.args.is_empty() {
        args.args.remove(0)
    } else if args.common.list_backends {
        String::new()
    } else {
        return Err(simple_cli_error(
            "no script specified. Usage: sed [OPTION]... {script-only-if-no-other-script} [input-file]...",
            EXIT_BAD_SCRIPT,
        ));
    };
    let script = Script::parse(&source, args.extended, args.quiet)
        .map_err(|e| simple_cli_error(&e.to_string(), EXIT_BAD_SCRIPT))?;
    let script = Arc::new(script);

    let runtime: BackendRuntime<Input, Output> =
        init_runtime(Utility::Sed, &args.common, EXIT_BAD_INPUT, |builder, devices| {
            sed::register(builder, &script, devices)
        })?;
    if args.common.list_backends {
        print_backends(&runtime)?;
        return Ok(EXIT_OK);
    }

    let files = if args.args.is_empty() {
        vec!["-".to_string()]
    } else {
        args.args
    };
    let mut status = EXIT_OK;
    let mut inputs = Vec::with_capacity(files.len());
    for file in &files {
        match read_input(file) {
            Ok(data) => inputs.push(data),
            Err(e) => {
                eprintln!("sed: {e}");
                status = EXIT_BAD_INPUT;
            }
        }
    }

    if runtime.cancellation().is_cancelled() {
        return Err(backend_cli_error(interrupted(), EXIT_BAD_INPUT));
    }
    let done = runtime
        .run(STREAM_EDIT, join_inputs(inputs))
        .map_err(|e| backend_cli_error(e, EXIT_BAD_INPUT))?;
    log::debug!("edited {} bytes on {}", done.output.len(), done.backend);

    let mut out = io::stdout().lock();
    out.write_all(&done.output)
        .and_then(|_| out.flush())
        .map_err(|e| simple_cli_error(&format!("couldn't write: {e}"), EXIT_BAD_INPUT))?;
    Ok(status)
}

fn read_input(file: &str) -> Result<Vec<u8>, CliError> {
    if file == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| io_cli_error("reading", Path::new("-"), e, EXIT_BAD_INPUT))?;
        return Ok(buf);
    }
    let path = Path::new(file);
    fs::read(path).map_err(|e| io_cli_error("reading", path, e, EXIT_BAD_INPUT))
}

fn interrupted() -> BackendError {
    BackendError::Interrupted { attempted: Vec::new() }
}
