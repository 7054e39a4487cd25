//! Domain kernels, one operation per tool.
//!
//! Each module exposes the operation id, the compiled parameters produced by
//! the frontend's parser, a CPU kernel, and `register`, which adds the CPU
//! kernel plus a GPU kernel per opened device when the parameters allow one.

use std::ops::Range;

pub mod awk;
pub mod find;
pub mod grep;
pub mod sed;

/// Byte ranges of the lines in `data`, newline excluded. A final line without
/// a trailing newline is still a line; a trailing newline does not start an
/// empty one.
pub fn line_spans(data: &[u8]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            spans.push(start..i);
            start = i + 1;
        }
    }
    if start < data.len() {
        spans.push(start..data.len());
    }
    spans
}

/// Start offsets of `needle` in `hay` beginning inside `owned` and ending
/// before `limit`. Overlapping occurrences are all reported.
pub fn literal_hits(hay: &[u8], needle: &[u8], owned: Range<usize>, limit: usize) -> Vec<usize> {
    let mut hits = Vec::new();
    if needle.is_empty() {
        return hits;
    }
    for start in owned {
        let end = start + needle.len();
        if end > limit {
            break;
        }
        if &hay[start..end] == needle {
            hits.push(start);
        }
    }
    hits
}

/// Replace leftmost non-overlapping occurrences of `needle` in `line`.
/// Replaces only the first one unless `global`. Returns whether anything was
/// replaced.
pub fn replace_literal(line: &mut Vec<u8>, needle: &[u8], with: &[u8], global: bool) -> bool {
    if needle.is_empty() || line.len() < needle.len() {
        return false;
    }
    let mut out = Vec::with_capacity(line.len());
    let mut i = 0;
    let mut replaced = false;
    while i < line.len() {
        if (global || !replaced) && line[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
            replaced = true;
        } else {
            out.push(line[i]);
            i += 1;
        }
    }
    if replaced {
        *line = out;
    }
    replaced
}

/// Concatenate inputs into one stream, inserting a newline after any input
/// that does not end with one.
pub fn join_inputs<I: IntoIterator<Item = Vec<u8>>>(inputs: I) -> Vec<u8> {
    let mut out = Vec::new();
    for data in inputs {
        if !out.is_empty() && out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        out.extend_from_slice(&data);
    }
    out
}
