use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use gpu_utils::cli::{init_runtime, print_backends, report, CommonArgs};
use gpu_utils::io_utils::{backend_cli_error, io_cli_error, simple_cli_error, CliError};
use gpu_utils::kernels::awk::{self, parse_assignment, FieldSep, Input, Output, Program, FIELD_PROJECT};
use gpu_utils::kernels::join_inputs;
use gpu_utils::{logging, BackendError, BackendRuntime, Utility};

const EXIT_OK: i32 = 0;
const EXIT_BAD_INPUT: i32 = 1;
const EXIT_BAD_PROGRAM: i32 = 2;

/// Pattern scanning and field projection.
#[derive(Parser)]
#[command(name = "gawk", version)]
struct Args {
    /// Input field separator
    #[arg(short = 'F', long = "field-separator", value_name = "FS")]
    field_separator: Option<String>,
    /// Assign VAR before the program runs
    #[arg(short = 'v', long = "assign", value_name = "VAR=VALUE")]
    assign: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
    /// PROGRAM followed by input FILEs
    #[arg(value_name = "PROGRAM | FILE")]
    args: Vec<String>,
}

fn main() {
    logging::init("gawk");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report("gawk", &e);
            std::process::exit(e.code);
        }
    }
}

fn run() -> Result<i32, CliError> {
    let mut args = Args::parse();

    let mut vars = HashMap::new();
    for raw in &args.assign {
        let (name, value) =
            parse_assignment(raw).map_err(|msg| simple_cli_error(&msg, EXIT_BAD_PROGRAM))?;
        vars.insert(name, value);
    }
    let fs = args
        .field_separator
        .as_deref()
        .map(FieldSep::from_arg)
        .unwrap_or_default();

    let source = if !args.args.is_empty() {
        args.args.remove(0)
    } else if args.common.list_backends {
        "{ print }".to_string()
    } else {
        return Err(simple_cli_error(
            "usage: gawk [-F fs] [-v var=value] 'program' [file ...]",
            EXIT_BAD_PROGRAM,
        ));
    };
    let program = Program::parse(&source, fs, vars)
        .map_err(|e| simple_cli_error(&e.to_string(), EXIT_BAD_PROGRAM))?;
    let program = Arc::new(program);

    let runtime: BackendRuntime<Input, Output> =
        init_runtime(Utility::Gawk, &args.common, EXIT_BAD_PROGRAM, |builder, devices| {
            awk::register(builder, &program, devices)
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
                eprintln!("gawk: {e}");
                status = EXIT_BAD_INPUT;
            }
        }
    }

    if runtime.cancellation().is_cancelled() {
        return Err(backend_cli_error(interrupted(), EXIT_BAD_INPUT));
    }
    let done = runtime
        .run(FIELD_PROJECT, join_inputs(inputs))
        .map_err(|e| backend_cli_error(e, EXIT_BAD_INPUT))?;
    log::debug!("projected {} bytes on {}", done.output.len(), done.backend);

    let mut out = io::stdout().lock();
    out.write_all(&done.output)
        .and_then(|_| out.flush())
        .map_err(|e| simple_cli_error(&format!("write failure: {e}"), EXIT_BAD_INPUT))?;
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
