//! `sed` script parsing and the stream editor.
//!
//! Supported: `s/RE/REPL/FLAGS` (flags `g`, `p`, `i`/`I`, a decimal
//! occurrence), `p`, `d` and `q`, each with an optional line number, `$` or
//! `/RE/` address. Commands are separated by `;` or newlines, `#` starts a
//! comment. Patterns are POSIX basic syntax unless `-E` is given.

use std::sync::Arc;

use regex::bytes::{Captures, Regex, RegexBuilder};
use thiserror::Error;

use crate::backend::BackendKind;
use crate::device::{ComputeDevice, DeviceSet};
use crate::error::KernelError;
use crate::registry::{KernelDescriptor, Operation, RegistryBuilder, Utility};
use crate::tile::line_tiles;

use super::replace_literal;

pub const STREAM_EDIT: Operation = Operation("stream-edit");

pub type Input = Vec<u8>;
pub type Output = Vec<u8>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("-e expression #1, char {pos}: {msg}")]
pub struct ScriptError {
    pub pos: usize,
    pub msg: String,
}

fn err<T>(pos: usize, msg: impl Into<String>) -> Result<T, ScriptError> {
    Err(ScriptError {
        pos,
        msg: msg.into(),
    })
}

#[derive(Debug, Clone)]
pub enum Address {
    Line(usize),
    Last,
    Match(Regex),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplPart {
    Text(Vec<u8>),
    Whole,
    Group(usize),
}

#[derive(Debug, Clone)]
pub struct Substitution {
    regex: Regex,
    /// Pattern text when it has no regex operators.
    literal: Option<Vec<u8>>,
    replacement: Vec<ReplPart>,
    global: bool,
    print: bool,
    ignore_case: bool,
    occurrence: usize,
}

#[derive(Debug, Clone)]
pub enum Command {
    Substitute(Box<Substitution>),
    Print,
    Delete,
    Quit,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: Option<Address>,
    pub command: Command,
}

/// A parsed script plus the `-n` flag.
#[derive(Debug, Clone)]
pub struct Script {
    pub instructions: Vec<Instruction>,
    pub quiet: bool,
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    extended: bool,
}

impl Script {
    pub fn parse(source: &str, extended: bool, quiet: bool) -> Result<Script, ScriptError> {
        let mut p = Parser {
            chars: source.chars().collect(),
            pos: 0,
            extended,
        };
        let mut instructions = Vec::new();
        loop {
            p.skip_separators();
            if p.at_end() {
                break;
            }
            instructions.push(p.instruction()?);
            p.skip_blanks();
            match p.peek() {
                None | Some(';') | Some('\n') => {}
                Some('#') => p.skip_comment(),
                Some(c) => return err(p.pos + 1, format!("extra characters after command `{c}'")),
            }
        }
        Ok(Script {
            instructions,
            quiet,
        })
    }

    /// True when every command is an unaddressed literal substitution with
    /// no `p`, `i` or occurrence flag, and `-n` is off.
    pub fn is_literal(&self) -> bool {
        !self.quiet
            && self.instructions.iter().all(|ins| {
                ins.address.is_none()
                    && matches!(&ins.command, Command::Substitute(s)
                        if s.literal.is_some() && !s.print && !s.ignore_case && s.occurrence == 1)
            })
    }

    fn substitutions(&self) -> impl Iterator<Item = &Substitution> {
        self.instructions.iter().filter_map(|ins| match &ins.command {
            Command::Substitute(s) => Some(s.as_ref()),
            _ => None,
        })
    }
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    fn skip_comment(&mut self) {
        while !matches!(self.peek(), None | Some('\n')) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\n') | Some(';') => self.pos += 1,
                Some('#') => self.skip_comment(),
                _ => break,
            }
        }
    }

    fn instruction(&mut self) -> Result<Instruction, ScriptError> {
        let address = self.address()?;
        self.skip_blanks();
        let start = self.pos + 1;
        let command = match self.bump() {
            Some('s') => Command::Substitute(Box::new(self.substitution()?)),
            Some('p') => Command::Print,
            Some('d') => Command::Delete,
            Some('q') => Command::Quit,
            Some(c) => return err(start, format!("unknown command: `{c}'")),
            None => return err(start, "missing command"),
        };
        Ok(Instruction { address, command })
    }

    fn address(&mut self) -> Result<Option<Address>, ScriptError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                let mut n = 0usize;
                while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
                    n = n.saturating_mul(10).saturating_add(d as usize);
                    self.pos += 1;
                }
                if n == 0 {
                    return err(self.pos, "invalid usage of line address 0");
                }
                Ok(Some(Address::Line(n)))
            }
            Some('$') => {
                self.pos += 1;
                Ok(Some(Address::Last))
            }
            Some('/') => {
                self.pos += 1;
                let start = self.pos;
                let pattern = self.delimited('/')?;
                Ok(Some(Address::Match(self.compile(&pattern, false, start)?)))
            }
            _ => Ok(None),
        }
    }

    /// Read up to the unescaped `delim`. `\delim` becomes `delim`; other
    /// escapes are kept for the regex or replacement parser.
    fn delimited(&mut self, delim: char) -> Result<String, ScriptError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return err(self.pos, "unterminated address regex or `s' command"),
                Some(c) if c == delim => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) if c == delim => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return err(self.pos, "unterminated `s' command"),
                },
                Some('\n') if delim != '\n' => {
                    return err(self.pos, "unterminated address regex or `s' command")
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn compile(&self, pattern: &str, icase: bool, pos: usize) -> Result<Regex, ScriptError> {
        if pattern.is_empty() {
            return err(pos, "no previous regular expression");
        }
        let translated = if self.extended {
            pattern.to_string()
        } else {
            basic_to_extended(pattern)
        };
        RegexBuilder::new(&translated)
            .case_insensitive(icase)
            .build()
            .or_else(|e| err(pos, format!("invalid regular expression: {e}")))
    }

    fn substitution(&mut self) -> Result<Substitution, ScriptError> {
        let delim = match self.bump() {
            Some(c) if c != '\n' && c != '\\' => c,
            _ => return err(self.pos, "unterminated `s' command"),
        };
        let pat_pos = self.pos;
        let pattern = self.delimited(delim)?;
        let replacement_src = self.delimited(delim)?;

        let mut global = false;
        let mut print = false;
        let mut ignore_case = false;
        let mut occurrence: Option<usize> = None;
        loop {
            match self.peek() {
                Some('g') => global = true,
                Some('p') => print = true,
                Some('i') | Some('I') => ignore_case = true,
                Some(c) if c.is_ascii_digit() => {
                    let mut n = 0usize;
                    while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
                        n = n.saturating_mul(10).saturating_add(d as usize);
                        self.pos += 1;
                    }
                    if n == 0 {
                        return err(self.pos, "number option to `s' command may not be zero");
                    }
                    if occurrence.replace(n).is_some() {
                        return err(self.pos, "multiple number options to `s' command");
                    }
                    continue;
                }
                None | Some(';') | Some('\n') | Some(' ') | Some('\t') | Some('#') => break,
                Some(_) => return err(self.pos + 1, "unknown option to `s'"),
            }
            self.pos += 1;
        }

        let regex = self.compile(&pattern, ignore_case, pat_pos)?;
        let replacement = parse_replacement(&replacement_src);
        let groups = regex.captures_len() - 1;
        for part in &replacement {
            if let ReplPart::Group(n) = part {
                if *n > groups {
                    return err(self.pos, format!("invalid reference \\{n} on `s' command's RHS"));
                }
            }
        }
        let literal = (!has_meta(&pattern, self.extended)).then(|| pattern.clone().into_bytes());
        Ok(Substitution {
            regex,
            literal,
            replacement,
            global,
            print,
            ignore_case,
            occurrence: occurrence.unwrap_or(1),
        })
    }
}

fn has_meta(pattern: &str, extended: bool) -> bool {
    let meta: &str = if extended {
        r"\.[]*^$+?(){}|"
    } else {
        r"\.[]*^$"
    };
    pattern.chars().any(|c| meta.contains(c))
}

/// Rewrite POSIX basic syntax into the `regex` crate's syntax: `\( \) \{ \}
/// \+ \? \|` become operators and their bare forms become literals.
pub fn basic_to_extended(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e @ ('(' | ')' | '{' | '}' | '+' | '?' | '|')) => out.push(e),
                Some(e) => {
                    out.push('\\');
                    out.push(e);
                }
                None => out.push_str(r"\\"),
            },
            '(' | ')' | '{' | '}' | '+' | '?' | '|' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn parse_replacement(src: &str) -> Vec<ReplPart> {
    let mut parts = Vec::new();
    let mut text = Vec::new();
    let mut chars = src.chars();
    let flush = |text: &mut Vec<u8>, parts: &mut Vec<ReplPart>| {
        if !text.is_empty() {
            parts.push(ReplPart::Text(std::mem::take(text)));
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '&' => {
                flush(&mut text, &mut parts);
                parts.push(ReplPart::Whole);
            }
            '\\' => match chars.next() {
                Some(d @ '0'..='9') => {
                    flush(&mut text, &mut parts);
                    let n = d as usize - '0' as usize;
                    parts.push(if n == 0 { ReplPart::Whole } else { ReplPart::Group(n) });
                }
                Some('n') => text.push(b'\n'),
                Some('t') => text.push(b'\t'),
                Some(other) => {
                    let mut buf = [0u8; 4];
                    text.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => text.push(b'\\'),
            },
            c => {
                let mut buf = [0u8; 4];
                text.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    flush(&mut text, &mut parts);
    parts
}

impl Substitution {
    fn expand(&self, caps: &Captures<'_>, out: &mut Vec<u8>) {
        for part in &self.replacement {
            match part {
                ReplPart::Text(t) => out.extend_from_slice(t),
                ReplPart::Whole => out.extend_from_slice(&caps[0]),
                ReplPart::Group(n) => {
                    if let Some(m) = caps.get(*n) {
                        out.extend_from_slice(m.as_bytes());
                    }
                }
            }
        }
    }

    /// Apply to the pattern space; true when a replacement was made.
    fn apply(&self, space: &mut Vec<u8>) -> bool {
        let mut out = Vec::with_capacity(space.len());
        let mut last = 0;
        let mut replaced = false;
        for (k, caps) in self.regex.captures_iter(space).enumerate() {
            let nth = k + 1;
            if nth < self.occurrence {
                continue;
            }
            if nth > self.occurrence && !self.global {
                break;
            }
            let m = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            out.extend_from_slice(&space[last..m.start()]);
            self.expand(&caps, &mut out);
            last = m.end();
            replaced = true;
        }
        if replaced {
            out.extend_from_slice(&space[last..]);
            *space = out;
        }
        replaced
    }

    /// Replacement bytes for a literal pattern: `&` is the pattern itself.
    fn literal_replacement(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let lit = self.literal.clone()?;
        let mut with = Vec::new();
        for part in &self.replacement {
            match part {
                ReplPart::Text(t) => with.extend_from_slice(t),
                ReplPart::Whole => with.extend_from_slice(&lit),
                ReplPart::Group(_) => return None,
            }
        }
        Some((lit, with))
    }
}

impl Address {
    fn matches(&self, line_no: usize, is_last: bool, space: &[u8]) -> bool {
        match self {
            Address::Line(n) => *n == line_no,
            Address::Last => is_last,
            Address::Match(re) => re.is_match(space),
        }
    }
}

/// Full interpreter.
pub fn cpu_stream_edit(script: &Script, data: &[u8]) -> Output {
    let mut out = Vec::with_capacity(data.len());
    let lines: Vec<&[u8]> = data.split_inclusive(|&b| b == b'\n').collect();
    let count = lines.len();

    'lines: for (i, raw) in lines.iter().enumerate() {
        let (body, newline) = match raw.strip_suffix(b"\n") {
            Some(body) => (body, true),
            None => (*raw, false),
        };
        let line_no = i + 1;
        let is_last = line_no == count;
        let mut space = body.to_vec();
        let emit = |out: &mut Vec<u8>, space: &[u8]| {
            out.extend_from_slice(space);
            if newline {
                out.push(b'\n');
            }
        };

        for ins in &script.instructions {
            if let Some(addr) = &ins.address {
                if !addr.matches(line_no, is_last, &space) {
                    continue;
                }
            }
            match &ins.command {
                Command::Substitute(s) => {
                    if s.apply(&mut space) && s.print {
                        emit(&mut out, &space);
                    }
                }
                Command::Print => emit(&mut out, &space),
                Command::Delete => continue 'lines,
                Command::Quit => {
                    if !script.quiet {
                        emit(&mut out, &space);
                    }
                    break 'lines;
                }
            }
        }
        if !script.quiet {
            emit(&mut out, &space);
        }
    }
    out
}

/// Per-line literal replacement over tiles of whole lines.
pub fn gpu_stream_edit(device: &ComputeDevice, script: &Script, data: &[u8]) -> Result<Output, KernelError> {
    let subs: Vec<(Vec<u8>, Vec<u8>, bool)> = script
        .substitutions()
        .map(|s| {
            s.literal_replacement()
                .map(|(lit, with)| (lit, with, s.global))
                .ok_or_else(|| KernelError::UnsupportedInput("substitution is not literal".into()))
        })
        .collect::<Result<_, _>>()?;

    let ranges = line_tiles(data, device.limits().tile_len);
    let chunks = device.dispatch_ranges(&ranges, |range| {
        let mut out = Vec::with_capacity(range.len());
        for raw in data[range].split_inclusive(|&b| b == b'\n') {
            let (body, newline) = match raw.strip_suffix(b"\n") {
                Some(body) => (body, true),
                None => (raw, false),
            };
            let mut line = body.to_vec();
            for (lit, with, global) in &subs {
                replace_literal(&mut line, lit, with, *global);
            }
            out.extend_from_slice(&line);
            if newline {
                out.push(b'\n');
            }
        }
        out
    })?;
    Ok(chunks.concat())
}

pub fn register(builder: &mut RegistryBuilder<Input, Output>, script: &Arc<Script>, devices: &DeviceSet) {
    let cpu = Arc::clone(script);
    builder.register(KernelDescriptor::new(
        Utility::Sed,
        STREAM_EDIT,
        BackendKind::Cpu,
        move |data: &Input| Ok(cpu_stream_edit(&cpu, data)),
    ));
    if !script.is_literal() {
        log::debug!("sed: script needs the interpreter, cpu kernel only");
        return;
    }
    for device in devices.iter() {
        let device = Arc::clone(device);
        let gpu = Arc::clone(script);
        builder.register(KernelDescriptor::new(
            Utility::Sed,
            STREAM_EDIT,
            device.kind(),
            move |data: &Input| gpu_stream_edit(&device, &gpu, data),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceLimits;

    fn run(script: &str, input: &str) -> String {
        let s = Script::parse(script, false, false).unwrap();
        String::from_utf8(cpu_stream_edit(&s, input.as_bytes())).unwrap()
    }

    #[test]
    fn substitute_flags() {
        assert_eq!(run("s/a/b/", "aaa\n"), "baa\n");
        assert_eq!(run("s/a/b/g", "aaa\n"), "bbb\n");
        assert_eq!(run("s/a/b/2", "aaa\n"), "aba\n");
        assert_eq!(run("s/a/b/2g", "aaaa\n"), "abbb\n");
        assert_eq!(run("s/A/b/i", "a\n"), "b\n");
        assert_eq!(run("s|/|_|g", "/usr/bin\n"), "_usr_bin\n");
    }

    #[test]
    fn replacement_references() {
        assert_eq!(run(r"s/\(a\)\(b\)/\2\1/", "ab\n"), "ba\n");
        assert_eq!(run("s/x/[&]/", "axb\n"), "a[x]b\n");
        assert_eq!(run(r"s/x/\&/", "x\n"), "&\n");
        let e = Script::parse("s/(a)/<\\1>/", true, false).unwrap();
        assert_eq!(cpu_stream_edit(&e, b"a\n"), b"<a>\n");
    }

    #[test]
    fn basic_syntax_translation() {
        assert_eq!(basic_to_extended(r"a\+b+"), r"a+b\+");
        assert_eq!(basic_to_extended(r"\(x\)|y"), r"(x)\|y");
        assert_eq!(basic_to_extended(r"\."), r"\.");
    }

    #[test]
    fn addresses_and_commands() {
        assert_eq!(run("2d", "a\nb\nc\n"), "a\nc\n");
        assert_eq!(run("$d", "a\nb\nc\n"), "a\nb\n");
        assert_eq!(run("/b/s/b/B/", "a\nb\nbb\n"), "a\nB\nBb\n");
        assert_eq!(run("2q", "a\nb\nc\n"), "a\nb\n");
        assert_eq!(run("p", "a\n"), "a\na\n");
        let quiet = Script::parse("/x/p", false, true).unwrap();
        assert_eq!(cpu_stream_edit(&quiet, b"a\nx\n"), b"x\n");
        let sp = Script::parse("s/a/b/p", false, true).unwrap();
        assert_eq!(cpu_stream_edit(&sp, b"a\nc\n"), b"b\n");
    }

    #[test]
    fn multiple_commands_and_comments() {
        assert_eq!(run("s/a/b/;s/b/c/", "a\n"), "c\n");
        assert_eq!(run("# note\ns/a/b/\n  p", "a\n"), "b\nb\n");
    }

    #[test]
    fn missing_final_newline_is_kept() {
        assert_eq!(run("s/a/b/", "a\na"), "b\nb");
    }

    #[test]
    fn parse_errors() {
        assert!(Script::parse("k", false, false).is_err());
        assert!(Script::parse("s/a/b", false, false).is_err());
        assert!(Script::parse("s/a/b/z", false, false).is_err());
        assert!(Script::parse("s/a/\\1/", false, false).is_err());
        assert!(Script::parse("0p", false, false).is_err());
        assert!(Script::parse("pq", false, false).is_err());
        let e = Script::parse("x", false, false).unwrap_err();
        assert_eq!(e.to_string(), "-e expression #1, char 1: unknown command: `x'");
    }

    #[test]
    fn literal_scripts_only() {
        assert!(Script::parse("s/a/b/g;s/c/&&/", false, false).unwrap().is_literal());
        assert!(!Script::parse("s/a/b/", false, true).unwrap().is_literal());
        assert!(!Script::parse("s/a./b/", false, false).unwrap().is_literal());
        assert!(!Script::parse("1s/a/b/", false, false).unwrap().is_literal());
        assert!(!Script::parse("s/a/b/p", false, false).unwrap().is_literal());
        assert!(!Script::parse("p", false, false).unwrap().is_literal());
        assert!(Script::parse("s/a+/b/", false, false).unwrap().is_literal());
        assert!(!Script::parse("s/a+/b/", true, false).unwrap().is_literal());
    }

    #[test]
    fn gpu_edit_matches_cpu() {
        let script = Script::parse("s/ab/X/g;s/X/&-&/", false, false).unwrap();
        let data = b"abab\nzz\nab\n\nxaby";
        let dev = ComputeDevice::new(
            BackendKind::Metal,
            "tiny",
            DeviceLimits {
                max_buffer_len: 1 << 20,
                tile_len: 4,
            },
        );
        assert_eq!(gpu_stream_edit(&dev, &script, data).unwrap(), cpu_stream_edit(&script, data));
    }
}
