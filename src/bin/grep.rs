use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser};
use rayon::prelude::*;

use gpu_utils::cli::{init_runtime, print_backends, report, CommonArgs};
use gpu_utils::io_utils::{backend_cli_error, io_cli_error, simple_cli_error, CliError};
use gpu_utils::kernels::grep::{self, GrepParams, Input, Output, LINE_MATCH};
use gpu_utils::{logging, BackendError, BackendRuntime, Utility};

const EXIT_MATCH: i32 = 0;
const EXIT_NO_MATCH: i32 = 1;
const EXIT_TROUBLE: i32 = 2;

/// Files searched concurrently before their results are written out.
const CHUNK: usize = 64;

/// Search files for lines matching a pattern.
#[derive(Parser)]
#[command(name = "grep", version, disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
    /// Use PATTERN for matching (repeatable)
    #[arg(short = 'e', long = "regexp", value_name = "PATTERN")]
    regexp: Vec<String>,
    /// PATTERN is a set of fixed strings
    #[arg(short = 'F', long = "fixed-strings")]
    fixed: bool,
    /// PATTERN is an extended regular expression
    #[arg(short = 'E', long = "extended-regexp")]
    extended: bool,
    /// Ignore case distinctions
    #[arg(short = 'i', long = "ignore-case")]
    ignore_case: bool,
    /// Select non-matching lines
    #[arg(short = 'v', long = "invert-match")]
    invert: bool,
    /// Prefix each line with its line number
    #[arg(short = 'n', long = "line-number")]
    line_number: bool,
    /// Print only a count of selected lines per file
    #[arg(short = 'c', long = "count")]
    count: bool,
    /// Print only names of files with selected lines
    #[arg(short = 'l', long = "files-with-matches")]
    files_with_matches: bool,
    /// Suppress all normal output
    #[arg(short = 'q', long = "quiet", alias = "silent")]
    quiet: bool,
    /// Print the file name for each match
    #[arg(short = 'H', long = "with-filename")]
    with_filename: bool,
    /// Suppress the file name prefix on output
    #[arg(short = 'h', long = "no-filename")]
    no_filename: bool,
    /// Read all files under each directory, recursively
    #[arg(short = 'r', long = "recursive")]
    recursive: bool,
    #[command(flatten)]
    common: CommonArgs,
    /// PATTERN followed by FILEs
    #[arg(value_name = "PATTERN | FILE")]
    args: Vec<String>,
}

/// Result of searching one input. `data` is kept only when the selected
/// lines will be printed.
enum Searched {
    Done {
        label: String,
        data: Option<Input>,
        matches: Output,
    },
    Failed(CliError),
}

fn main() {
    logging::init("grep");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report("grep", &e);
            std::process::exit(e.code);
        }
    }
}

fn run() -> Result<i32, CliError> {
    let mut args = Args::parse();

    let patterns = if !args.regexp.is_empty() {
        std::mem::take(&mut args.regexp)
    } else if !args.args.is_empty() {
        vec![args.args.remove(0)]
    } else if args.common.list_backends {
        Vec::new()
    } else {
        return Err(simple_cli_error(
            "no pattern given. Usage: grep [OPTION]... PATTERNS [FILE]...",
            EXIT_TROUBLE,
        ));
    };
    // A single argument may hold several newline separated patterns.
    let patterns: Vec<String> = patterns
        .iter()
        .flat_map(|p| p.split('\n').map(str::to_string).collect::<Vec<_>>())
        .collect();

    let params = GrepParams {
        patterns,
        fixed: args.fixed,
        ignore_case: args.ignore_case,
        invert: args.invert,
    };
    let matcher = params
        .compile()
        .map_err(|e| simple_cli_error(&format!("invalid pattern: {e}"), EXIT_TROUBLE))?;
    if args.extended {
        log::debug!("-E: extended syntax is the default dialect");
    }

    let runtime: BackendRuntime<Input, Output> =
        init_runtime(Utility::Grep, &args.common, EXIT_TROUBLE, |builder, devices| {
            grep::register(builder, &matcher, devices)
        })?;
    if args.common.list_backends {
        print_backends(&runtime)?;
        return Ok(EXIT_MATCH);
    }

    let mut failures = Vec::new();
    let inputs = collect_inputs(&args, &mut failures);
    let show_names = args.with_filename
        || (!args.no_filename && (inputs.len() > 1 || args.recursive));

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let mut any_selected = false;
    let mut trouble = !failures.is_empty();
    for err in failures {
        eprintln!("grep: {err}");
    }

    let keep_lines = !(args.count || args.files_with_matches || args.quiet);
    for chunk in inputs.chunks(CHUNK) {
        let results: Vec<Searched> = chunk
            .par_iter()
            .map(|input| search(&runtime, input, keep_lines))
            .collect();
        for result in results {
            let (label, data, matches) = match result {
                Searched::Done {
                    label,
                    data,
                    matches,
                } => (label, data, matches),
                Searched::Failed(err) if err.code == EXIT_TROUBLE => {
                    eprintln!("grep: {err}");
                    trouble = true;
                    continue;
                }
                Searched::Failed(err) => return Err(err),
            };
            any_selected |= !matches.is_empty();
            if args.quiet {
                if any_selected {
                    return Ok(EXIT_MATCH);
                }
                continue;
            }
            write_result(&mut out, &args, show_names, &label, data.as_deref(), &matches)
                .map_err(|e| simple_cli_error(&format!("write error: {e}"), EXIT_TROUBLE))?;
        }
    }
    out.flush()
        .map_err(|e| simple_cli_error(&format!("write error: {e}"), EXIT_TROUBLE))?;

    Ok(if trouble && !(args.quiet && any_selected) {
        EXIT_TROUBLE
    } else if any_selected {
        EXIT_MATCH
    } else {
        EXIT_NO_MATCH
    })
}

/// Expand the file operands. Directories are walked with `-r` and reported
/// otherwise.
fn collect_inputs(args: &Args, failures: &mut Vec<CliError>) -> Vec<PathBuf> {
    let operands: Vec<PathBuf> = if args.args.is_empty() {
        vec![PathBuf::from(if args.recursive { "." } else { "-" })]
    } else {
        args.args.iter().map(PathBuf::from).collect()
    };

    let mut inputs = Vec::new();
    for path in operands {
        if path.as_os_str() != "-" && path.is_dir() {
            if !args.recursive {
                failures.push(simple_cli_error(
                    &format!("{}: Is a directory", path.display()),
                    EXIT_TROUBLE,
                ));
                continue;
            }
            for entry in walkdir::WalkDir::new(&path).sort_by_file_name() {
                match entry {
                    Ok(e) if e.file_type().is_file() => inputs.push(e.into_path()),
                    Ok(_) => {}
                    Err(e) => failures.push(simple_cli_error(&e.to_string(), EXIT_TROUBLE)),
                }
            }
        } else {
            inputs.push(path);
        }
    }
    inputs
}

fn read_input(path: &Path) -> Result<Vec<u8>, CliError> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| io_cli_error("reading", Path::new("(standard input)"), e, EXIT_TROUBLE))?;
        Ok(buf)
    } else {
        fs::read(path).map_err(|e| io_cli_error("reading", path, e, EXIT_TROUBLE))
    }
}

fn search(runtime: &BackendRuntime<Input, Output>, path: &Path, keep_lines: bool) -> Searched {
    if runtime.cancellation().is_cancelled() {
        let interrupted = BackendError::Interrupted { attempted: Vec::new() };
        return Searched::Failed(backend_cli_error(interrupted, EXIT_TROUBLE));
    }
    let label = if path.as_os_str() == "-" {
        "(standard input)".to_string()
    } else {
        path.display().to_string()
    };
    let data: Input = match read_input(path) {
        Ok(buf) => Arc::from(buf),
        Err(e) => return Searched::Failed(e),
    };
    match runtime.run(LINE_MATCH, Arc::clone(&data)) {
        Ok(done) => {
            log::debug!("{label}: {} lines on {}", done.output.len(), done.backend);
            let data = (keep_lines && !done.output.is_empty()).then_some(data);
            Searched::Done {
                label,
                data,
                matches: done.output,
            }
        }
        Err(e) => Searched::Failed(backend_cli_error(e, EXIT_TROUBLE)),
    }
}

fn write_result<W: Write>(
    out: &mut W,
    args: &Args,
    show_names: bool,
    label: &str,
    data: Option<&[u8]>,
    matches: &Output,
) -> io::Result<()> {
    if args.files_with_matches {
        if !matches.is_empty() {
            writeln!(out, "{label}")?;
        }
        return Ok(());
    }
    if args.count {
        if show_names {
            write!(out, "{label}:")?;
        }
        return writeln!(out, "{}", matches.len());
    }
    let Some(data) = data else {
        return Ok(());
    };
    for m in matches {
        if show_names {
            write!(out, "{label}:")?;
        }
        if args.line_number {
            write!(out, "{}:", m.number)?;
        }
        out.write_all(&data[m.range.clone()])?;
        out.write_all(b"\n")?;
    }
    Ok(())
}
