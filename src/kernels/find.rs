//! `find` expression parsing and entry filtering.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::device::{ComputeDevice, DeviceSet};
use crate::error::KernelError;
use crate::registry::{KernelDescriptor, Operation, RegistryBuilder, Utility};

pub const ENTRY_FILTER: Operation = Operation("entry-filter");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Other,
}

/// One traversed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub file_type: EntryType,
    pub depth: usize,
}

impl Entry {
    /// Base name used by `-name`; the path itself for roots like `.`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_else(|| self.path.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

/// Kernel input: one traversal batch.
pub type Input = Arc<[Entry]>;
/// Indices of matching entries, ascending.
pub type Output = Vec<usize>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("missing argument to `{0}'")]
    MissingArgument(String),
    #[error("unknown predicate `{0}'")]
    UnknownPredicate(String),
    #[error("invalid argument `{value}' to `{flag}'")]
    InvalidArgument { flag: String, value: String },
    #[error("paths must precede expression: `{0}'")]
    PathAfterExpression(String),
}

// ---------------------------------------------------------------------------
// Glob

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Char(char),
    Any,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// Shell pattern as accepted by `-name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    tokens: Vec<Token>,
    fold_case: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Self {
        Self::build(pattern, false)
    }

    /// Case insensitive, for `-iname`.
    pub fn new_folded(pattern: &str) -> Self {
        Self::build(&pattern.to_lowercase(), true)
    }

    fn build(pattern: &str, fold_case: bool) -> Self {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' => tokens.push(Token::Star),
                '?' => tokens.push(Token::Any),
                '\\' if i + 1 < chars.len() => {
                    i += 1;
                    tokens.push(Token::Char(chars[i]));
                }
                '[' => match parse_class(&chars[i + 1..]) {
                    Some((token, used)) => {
                        tokens.push(token);
                        i += used;
                    }
                    None => tokens.push(Token::Char('[')),
                },
                c => tokens.push(Token::Char(c)),
            }
            i += 1;
        }
        Self { tokens, fold_case }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name: Vec<char> = if self.fold_case {
            name.to_lowercase().chars().collect()
        } else {
            name.chars().collect()
        };
        match_tokens(&self.tokens, &name)
    }
}

/// Parse the body of a bracket expression after `[`. Returns the token and
/// the number of chars consumed including the closing `]`.
fn parse_class(rest: &[char]) -> Option<(Token, usize)> {
    let mut i = 0;
    let negated = matches!(rest.first(), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    while i < rest.len() {
        let c = rest[i];
        if c == ']' && !first {
            return Some((Token::Class { negated, ranges }, i + 1));
        }
        first = false;
        let lo = if c == '\\' && i + 1 < rest.len() {
            i += 1;
            rest[i]
        } else {
            c
        };
        if i + 2 < rest.len() && rest[i + 1] == '-' && rest[i + 2] != ']' {
            ranges.push((lo, rest[i + 2]));
            i += 3;
        } else {
            ranges.push((lo, lo));
            i += 1;
        }
    }
    None
}

fn match_tokens(tokens: &[Token], name: &[char]) -> bool {
    // Iterative matcher with single-star backtracking.
    let (mut t, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        let step = match tokens.get(t) {
            Some(Token::Star) => {
                star = Some((t, n));
                t += 1;
                continue;
            }
            Some(Token::Any) => true,
            Some(Token::Char(c)) => *c == name[n],
            Some(Token::Class { negated, ranges }) => {
                ranges.iter().any(|&(lo, hi)| lo <= name[n] && name[n] <= hi) != *negated
            }
            None => false,
        };
        if step {
            t += 1;
            n += 1;
        } else if let Some((st, sn)) = star {
            t = st + 1;
            n = sn + 1;
            star = Some((st, sn + 1));
        } else {
            return false;
        }
    }
    tokens[t..].iter().all(|tok| *tok == Token::Star)
}

// ---------------------------------------------------------------------------
// Expression

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    Name(Glob),
    Type(EntryType),
}

impl Test {
    fn matches(&self, entry: &Entry) -> bool {
        match self {
            Test::Name(glob) => glob.matches(&entry.name()),
            Test::Type(kind) => entry.file_type == *kind,
        }
    }
}

/// ANDed tests plus traversal depth bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expression {
    pub tests: Vec<Test>,
    pub min_depth: usize,
    pub max_depth: Option<usize>,
}

impl Expression {
    /// Split `find` arguments into starting points and the expression.
    pub fn parse(args: &[String]) -> Result<(Vec<String>, Expression), ExprError> {
        let split = args
            .iter()
            .position(|a| a.starts_with('-') && a.len() > 1)
            .unwrap_or(args.len());
        let mut paths = args[..split].to_vec();
        if paths.is_empty() {
            paths.push(".".to_string());
        }

        let mut expr = Expression::default();
        let mut rest = args[split..].iter();
        while let Some(arg) = rest.next() {
            let mut value = |flag: &str| {
                rest.next()
                    .cloned()
                    .ok_or_else(|| ExprError::MissingArgument(flag.to_string()))
            };
            match arg.as_str() {
                "-name" => expr.tests.push(Test::Name(Glob::new(&value("-name")?))),
                "-iname" => expr.tests.push(Test::Name(Glob::new_folded(&value("-iname")?))),
                "-type" => {
                    let v = value("-type")?;
                    let kind = match v.as_str() {
                        "f" => EntryType::File,
                        "d" => EntryType::Dir,
                        "l" => EntryType::Symlink,
                        _ => {
                            return Err(ExprError::InvalidArgument {
                                flag: "-type".into(),
                                value: v,
                            })
                        }
                    };
                    expr.tests.push(Test::Type(kind));
                }
                "-maxdepth" => expr.max_depth = Some(depth_arg("-maxdepth", value("-maxdepth")?)?),
                "-mindepth" => expr.min_depth = depth_arg("-mindepth", value("-mindepth")?)?,
                "-print" => {}
                other if other.starts_with('-') => {
                    return Err(ExprError::UnknownPredicate(other.to_string()))
                }
                other => return Err(ExprError::PathAfterExpression(other.to_string())),
            }
        }
        Ok((paths, expr))
    }

    pub fn has_tests(&self) -> bool {
        !self.tests.is_empty()
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.tests.iter().all(|t| t.matches(entry))
    }
}

fn depth_arg(flag: &str, value: String) -> Result<usize, ExprError> {
    value.parse().map_err(|_| ExprError::InvalidArgument {
        flag: flag.to_string(),
        value,
    })
}

/// Map a walkdir file type onto [`EntryType`].
pub fn entry_type(ft: std::fs::FileType) -> EntryType {
    if ft.is_symlink() {
        EntryType::Symlink
    } else if ft.is_dir() {
        EntryType::Dir
    } else if ft.is_file() {
        EntryType::File
    } else {
        EntryType::Other
    }
}

// ---------------------------------------------------------------------------
// Kernels

pub fn cpu_entry_filter(expr: &Expression, entries: &[Entry]) -> Output {
    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| expr.matches(e))
        .map(|(i, _)| i)
        .collect()
}

pub fn gpu_entry_filter(
    device: &ComputeDevice,
    expr: &Expression,
    entries: &[Entry],
) -> Result<Output, KernelError> {
    let tiles = device.dispatch(entries.len(), 0, |owned, _| {
        owned.filter(|&i| expr.matches(&entries[i])).collect::<Vec<_>>()
    })?;
    Ok(tiles.into_iter().flatten().collect())
}

pub fn register(builder: &mut RegistryBuilder<Input, Output>, expr: &Expression, devices: &DeviceSet) {
    let cpu = expr.clone();
    builder.register(KernelDescriptor::new(
        Utility::Find,
        ENTRY_FILTER,
        BackendKind::Cpu,
        move |entries: &Input| Ok(cpu_entry_filter(&cpu, entries)),
    ));
    if !expr.has_tests() {
        return;
    }
    for device in devices.iter() {
        let device = Arc::clone(device);
        let gpu = expr.clone();
        builder.register(KernelDescriptor::new(
            Utility::Find,
            ENTRY_FILTER,
            device.kind(),
            move |entries: &Input| gpu_entry_filter(&device, &gpu, entries),
        ));
    }
}
