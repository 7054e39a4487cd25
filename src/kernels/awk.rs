//! A small `awk` dialect: pattern rules with `print` actions.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::device::{ComputeDevice, DeviceSet};
use crate::error::KernelError;
use crate::registry::{KernelDescriptor, Operation, RegistryBuilder, Utility};
use crate::tile::line_tiles;

pub const FIELD_PROJECT: Operation = Operation("field-project");

pub type Input = Vec<u8>;
pub type Output = Vec<u8>;

const OFS: &str = " ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cmd. line:1: {msg} at char {pos}")]
pub struct ProgramError {
    pub pos: usize,
    pub msg: String,
}

fn err<T>(pos: usize, msg: impl Into<String>) -> Result<T, ProgramError> {
    Err(ProgramError {
        pos,
        msg: msg.into(),
    })
}

/// Input field separator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldSep {
    /// Runs of blanks, leading and trailing blanks ignored.
    #[default]
    Blank,
    Literal(String),
}

impl FieldSep {
    /// Interpret a `-F` argument. `\t` and `t` mean a tab.
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            " " | "" => FieldSep::Blank,
            "t" | "\\t" => FieldSep::Literal("\t".into()),
            other => FieldSep::Literal(other.replace("\\t", "\t")),
        }
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            FieldSep::Blank => line
                .split([' ', '\t'])
                .filter(|f| !f.is_empty())
                .collect(),
            FieldSep::Literal(_) if line.is_empty() => Vec::new(),
            FieldSep::Literal(sep) => line.split(sep.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef {
    Index(usize),
    Last,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    All,
    Begin,
    End,
    Match(Regex),
    FieldMatch {
        field: FieldRef,
        regex: Regex,
        negate: bool,
    },
    LineNumber(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Field(FieldRef),
    Nr,
    Nf,
    Var(String),
    Str(String),
}

/// One `print` statement; each item is a concatenation of terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Print {
    pub items: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: Pattern,
    pub prints: Vec<Print>,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub rules: Vec<Rule>,
    pub fs: FieldSep,
    pub vars: HashMap<String, String>,
}

struct Record<'a> {
    line: &'a str,
    fields: Vec<&'a str>,
    nr: usize,
}

impl<'a> Record<'a> {
    fn new(line: &'a str, nr: usize, fs: &FieldSep) -> Self {
        Self {
            line,
            fields: fs.split(line),
            nr,
        }
    }

    fn field(&self, field: FieldRef) -> &'a str {
        match field {
            FieldRef::Index(0) => self.line,
            FieldRef::Index(n) => self.fields.get(n - 1).copied().unwrap_or(""),
            FieldRef::Last if self.fields.is_empty() => self.line,
            FieldRef::Last => self.fields[self.fields.len() - 1],
        }
    }
}

impl Program {
    pub fn parse(source: &str, fs: FieldSep, vars: HashMap<String, String>) -> Result<Program, ProgramError> {
        let mut p = Parser {
            chars: source.chars().collect(),
            pos: 0,
        };
        let mut rules = Vec::new();
        loop {
            p.skip_separators();
            if p.at_end() {
                break;
            }
            rules.push(p.rule()?);
            p.skip_blanks();
            match p.peek() {
                None | Some(';') | Some('\n') => {}
                Some(c) => return err(p.pos + 1, format!("syntax error near `{c}'")),
            }
        }
        if rules.is_empty() {
            return err(0, "empty program");
        }
        Ok(Program { rules, fs, vars })
    }

    /// True when every rule can run on a tile of lines in isolation.
    pub fn is_projection(&self) -> bool {
        self.rules
            .iter()
            .all(|r| matches!(r.pattern, Pattern::All | Pattern::LineNumber(_)))
    }

    fn matches(&self, pattern: &Pattern, rec: &Record<'_>) -> bool {
        match pattern {
            Pattern::All => true,
            Pattern::Begin | Pattern::End => false,
            Pattern::Match(re) => re.is_match(rec.line),
            Pattern::FieldMatch {
                field,
                regex,
                negate,
            } => regex.is_match(rec.field(*field)) != *negate,
            Pattern::LineNumber(n) => rec.nr == *n,
        }
    }

    fn eval(&self, expr: &Expr, rec: &Record<'_>, out: &mut String) {
        match expr {
            Expr::Field(f) => out.push_str(rec.field(*f)),
            Expr::Nr => out.push_str(&rec.nr.to_string()),
            Expr::Nf => out.push_str(&rec.fields.len().to_string()),
            Expr::Var(name) => out.push_str(self.vars.get(name).map(String::as_str).unwrap_or("")),
            Expr::Str(s) => out.push_str(s),
        }
    }

    fn exec(&self, rule: &Rule, rec: &Record<'_>, out: &mut String) {
        for print in &rule.prints {
            if print.items.is_empty() {
                out.push_str(rec.line);
            }
            for (i, item) in print.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(OFS);
                }
                for term in item {
                    self.eval(term, rec, out);
                }
            }
            out.push('\n');
        }
    }

    /// Run the main rules over `text`, numbering records from `first_nr`.
    /// Returns the last record and the record count.
    fn project<'t>(&self, text: &'t str, first_nr: usize, out: &mut String) -> (Option<&'t str>, usize) {
        let mut last = None;
        let mut count = 0;
        for (i, line) in text.split_terminator('\n').enumerate() {
            let rec = Record::new(line, first_nr + i, &self.fs);
            for rule in &self.rules {
                if self.matches(&rule.pattern, &rec) {
                    self.exec(rule, &rec, out);
                }
            }
            last = Some(line);
            count += 1;
        }
        (last, count)
    }

    fn run_special(&self, which: &Pattern, rec: &Record<'_>, out: &mut String) {
        for rule in &self.rules {
            if std::mem::discriminant(&rule.pattern) == std::mem::discriminant(which) {
                self.exec(rule, rec, out);
            }
        }
    }
}

/// Full interpreter including `BEGIN` and `END`.
pub fn cpu_field_project(program: &Program, data: &[u8]) -> Output {
    let text = String::from_utf8_lossy(data);
    let mut out = String::with_capacity(data.len());
    program.run_special(&Pattern::Begin, &Record::new("", 0, &program.fs), &mut out);
    let (last, count) = program.project(&text, 1, &mut out);
    let end = Record::new(last.unwrap_or(""), count, &program.fs);
    program.run_special(&Pattern::End, &end, &mut out);
    out.into_bytes()
}

/// Per-line projection over tiles of whole lines.
pub fn gpu_field_project(device: &ComputeDevice, program: &Program, data: &[u8]) -> Result<Output, KernelError> {
    if !program.is_projection() {
        return Err(KernelError::UnsupportedInput("program needs the interpreter".into()));
    }
    let ranges = line_tiles(data, device.limits().tile_len);
    let mut bases = Vec::with_capacity(ranges.len());
    let mut nr = 1;
    for r in &ranges {
        bases.push(nr);
        nr += data[r.clone()].iter().filter(|&&b| b == b'\n').count();
    }
    let chunks = device.dispatch_ranges(&ranges, |range| {
        let tile = ranges.partition_point(|r| r.start < range.start);
        let text = String::from_utf8_lossy(&data[range]);
        let mut out = String::new();
        program.project(&text, bases[tile], &mut out);
        out.into_bytes()
    })?;
    Ok(chunks.concat())
}

pub fn register(builder: &mut RegistryBuilder<Input, Output>, program: &Arc<Program>, devices: &DeviceSet) {
    let cpu = Arc::clone(program);
    builder.register(KernelDescriptor::new(
        Utility::Gawk,
        FIELD_PROJECT,
        BackendKind::Cpu,
        move |data: &Input| Ok(cpu_field_project(&cpu, data)),
    ));
    if !program.is_projection() {
        log::debug!("gawk: program uses regex or BEGIN/END, cpu kernel only");
        return;
    }
    for device in devices.iter() {
        let device = Arc::clone(device);
        let gpu = Arc::clone(program);
        builder.register(KernelDescriptor::new(
            Utility::Gawk,
            FIELD_PROJECT,
            device.kind(),
            move |data: &Input| gpu_field_project(&device, &gpu, data),
        ));
    }
}

/// Parse `-v NAME=VALUE`.
pub fn parse_assignment(arg: &str) -> Result<(String, String), String> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("`{arg}' argument to `-v' not in `var=value' form"))?;
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(format!("`{name}' is not a legal variable name"));
    }
    Ok((name.to_string(), unescape(value)))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\n') | Some(';')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ProgramError> {
        self.skip_blanks();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            err(self.pos + 1, format!("expected `{c}'"))
        }
    }

    fn ident(&mut self) -> Option<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        (self.pos > start).then(|| self.chars[start..self.pos].iter().collect())
    }

    fn number(&mut self) -> Option<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits.parse().ok()
    }

    fn rule(&mut self) -> Result<Rule, ProgramError> {
        let pattern = self.pattern()?;
        self.skip_blanks();
        let prints = if self.peek() == Some('{') {
            self.action()?
        } else if matches!(pattern, Pattern::Begin | Pattern::End) {
            return err(self.pos + 1, "BEGIN and END blocks must have an action part");
        } else {
            vec![Print { items: Vec::new() }]
        };
        Ok(Rule { pattern, prints })
    }

    fn pattern(&mut self) -> Result<Pattern, ProgramError> {
        self.skip_blanks();
        match self.peek() {
            Some('{') => Ok(Pattern::All),
            Some('/') => Ok(Pattern::Match(self.regex()?)),
            Some('$') => {
                self.pos += 1;
                let field = self.field_ref()?;
                self.skip_blanks();
                let negate = match (self.peek(), self.peek_at(1)) {
                    (Some('~'), _) => {
                        self.pos += 1;
                        false
                    }
                    (Some('!'), Some('~')) => {
                        self.pos += 2;
                        true
                    }
                    _ => return err(self.pos + 1, "expected `~' or `!~'"),
                };
                self.skip_blanks();
                let regex = self.regex()?;
                Ok(Pattern::FieldMatch {
                    field,
                    regex,
                    negate,
                })
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos + 1;
                match self.ident().as_deref() {
                    Some("BEGIN") => Ok(Pattern::Begin),
                    Some("END") => Ok(Pattern::End),
                    Some("NR") => {
                        self.expect('=')?;
                        if self.peek() != Some('=') {
                            return err(self.pos + 1, "expected `=='");
                        }
                        self.pos += 1;
                        self.skip_blanks();
                        self.number()
                            .map(Pattern::LineNumber)
                            .ok_or_else(|| ProgramError {
                                pos: self.pos + 1,
                                msg: "expected a line number".into(),
                            })
                    }
                    Some(other) => err(start, format!("unsupported pattern `{other}'")),
                    None => err(start, "syntax error"),
                }
            }
            _ => err(self.pos + 1, "syntax error"),
        }
    }

    fn regex(&mut self) -> Result<Regex, ProgramError> {
        if self.peek() != Some('/') {
            return err(self.pos + 1, "expected a regular expression");
        }
        self.pos += 1;
        let start = self.pos;
        let mut src = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return err(start, "unterminated regexp"),
                Some('/') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') if self.peek_at(1) == Some('/') => {
                    src.push('/');
                    self.pos += 2;
                }
                Some(c) => {
                    src.push(c);
                    self.pos += 1;
                }
            }
        }
        Regex::new(&src).or_else(|e| err(start, format!("invalid regexp: {e}")))
    }

    fn field_ref(&mut self) -> Result<FieldRef, ProgramError> {
        if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            return self
                .number()
                .map(FieldRef::Index)
                .ok_or_else(|| ProgramError {
                    pos: self.pos,
                    msg: "field index out of range".into(),
                });
        }
        match self.ident().as_deref() {
            Some("NF") => Ok(FieldRef::Last),
            _ => err(self.pos + 1, "expected a field number or NF after `$'"),
        }
    }

    fn action(&mut self) -> Result<Vec<Print>, ProgramError> {
        self.expect('{')?;
        let mut prints = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    return Ok(prints);
                }
                None => return err(self.pos, "unexpected end of program, missing `}'"),
                _ => {}
            }
            let start = self.pos + 1;
            match self.ident().as_deref() {
                Some("print") => prints.push(self.print()?),
                Some(other) => return err(start, format!("unsupported statement `{other}'")),
                None => return err(start, "syntax error"),
            }
        }
    }

    fn print(&mut self) -> Result<Print, ProgramError> {
        let mut items = Vec::new();
        let mut item = Vec::new();
        loop {
            self.skip_blanks();
            match self.peek() {
                None | Some('}') | Some(';') | Some('\n') => break,
                Some(',') => {
                    if item.is_empty() {
                        return err(self.pos + 1, "syntax error near `,'");
                    }
                    items.push(std::mem::take(&mut item));
                    self.pos += 1;
                    self.skip_separators_in_list();
                    continue;
                }
                _ => {}
            }
            item.push(self.term()?);
        }
        if !item.is_empty() {
            items.push(item);
        } else if !items.is_empty() {
            return err(self.pos + 1, "syntax error after `,'");
        }
        Ok(Print { items })
    }

    fn skip_separators_in_list(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\n')) {
            self.pos += 1;
        }
    }

    fn term(&mut self) -> Result<Expr, ProgramError> {
        let start = self.pos + 1;
        match self.peek() {
            Some('$') => {
                self.pos += 1;
                Ok(Expr::Field(self.field_ref()?))
            }
            Some('"') => {
                self.pos += 1;
                let mut s = String::new();
                loop {
                    match self.peek() {
                        None | Some('\n') => return err(start, "unterminated string"),
                        Some('"') => {
                            self.pos += 1;
                            break;
                        }
                        Some('\\') => {
                            self.pos += 1;
                            match self.peek() {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(c) => s.push(c),
                                None => return err(start, "unterminated string"),
                            }
                            self.pos += 1;
                        }
                        Some(c) => {
                            s.push(c);
                            self.pos += 1;
                        }
                    }
                }
                Ok(Expr::Str(s))
            }
            Some(c) if c.is_ascii_digit() => {
                let start_pos = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                Ok(Expr::Str(self.chars[start_pos..self.pos].iter().collect()))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => match self.ident().as_deref() {
                Some("NR") => Ok(Expr::Nr),
                Some("NF") => Ok(Expr::Nf),
                Some(name) => Ok(Expr::Var(name.to_string())),
                None => err(start, "syntax error"),
            },
            Some(c) => err(start, format!("syntax error near `{c}'")),
            None => err(start, "unexpected end of program"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceLimits;

    fn program(src: &str) -> Program {
        Program::parse(src, FieldSep::Blank, HashMap::new()).unwrap()
    }

    fn run(src: &str, input: &str) -> String {
        String::from_utf8(cpu_field_project(&program(src), input.as_bytes())).unwrap()
    }

    #[test]
    fn prints_fields() {
        assert_eq!(run("{ print $2, $1 }", "a b\n  c   d  \n"), "b a\nd c\n");
        assert_eq!(run("{print $NF}", "x y z\n"), "z\n");
        assert_eq!(run("{print NR \":\" $0}", "a\nb\n"), "1:a\n2:b\n");
        assert_eq!(run("{print NF}", "a b c\n\n"), "3\n0\n");
        assert_eq!(run("{ print $5 }", "a\n"), "\n");
        assert_eq!(run("{ print }", "keep me\n"), "keep me\n");
    }

    #[test]
    fn patterns_select_records() {
        assert_eq!(run("/b/", "abc\nxyz\nb\n"), "abc\nb\n");
        assert_eq!(run("$2 ~ /^[0-9]+$/ { print $1 }", "a 1\nb x\nc 22\n"), "a\nc\n");
        assert_eq!(run("$2 !~ /x/", "a 1\nb x\n"), "a 1\n");
        assert_eq!(run("NR==2", "a\nb\nc\n"), "b\n");
        assert_eq!(run("NR == 3 { print \"third\" }", "a\nb\nc\n"), "third\n");
    }

    #[test]
    fn begin_and_end() {
        assert_eq!(
            run("BEGIN { print \"start\" }\n{ print $1 }\nEND { print NR, $0 }", "a b\nc d\n"),
            "start\na\nc\n2 c d\n"
        );
        assert_eq!(run("BEGIN { print \"only\" }", ""), "only\n");
    }

    #[test]
    fn field_separator_and_vars() {
        let mut vars = HashMap::new();
        vars.insert("tag".to_string(), "T".to_string());
        let p = Program::parse("{ print tag, $2, missing }", FieldSep::from_arg(":"), vars).unwrap();
        assert_eq!(cpu_field_project(&p, b"a:b:c\n::\n"), b"T b \nT  \n");
        assert_eq!(FieldSep::from_arg("\\t"), FieldSep::Literal("\t".into()));
        assert_eq!(FieldSep::from_arg(" "), FieldSep::Blank);
    }

    #[test]
    fn assignments() {
        assert_eq!(parse_assignment("x=1").unwrap(), ("x".into(), "1".into()));
        assert_eq!(parse_assignment("t=a\\tb").unwrap().1, "a\tb");
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("1x=2").is_err());
    }

    #[test]
    fn parse_errors() {
        for bad in ["", "{ print $1", "BEGIN", "{ printf $1 }", "/abc", "$1 = /x/", "{ print $1, }", "foo"] {
            assert!(
                Program::parse(bad, FieldSep::Blank, HashMap::new()).is_err(),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn projection_detection() {
        assert!(program("{ print $1 }; NR==3").is_projection());
        assert!(!program("/x/ { print }").is_projection());
        assert!(!program("END { print NR }").is_projection());
    }

    #[test]
    fn gpu_projection_matches_cpu() {
        let p = program("{ print NR, $2 }\nNR==4 { print \"four\" }");
        let data = b"a b\nc d e\n\nf g\nh\ni j k l\nlast line";
        let dev = ComputeDevice::new(
            BackendKind::Vulkan,
            "tiny",
            DeviceLimits {
                max_buffer_len: 1 << 20,
                tile_len: 5,
            },
        );
        assert_eq!(gpu_field_project(&dev, &p, data).unwrap(), cpu_field_project(&p, data));
    }
}
