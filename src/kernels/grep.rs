//! `grep` line matching.

use std::ops::Range;
use std::sync::Arc;

use regex::bytes::{Regex, RegexBuilder};

use crate::backend::BackendKind;
use crate::device::{ComputeDevice, DeviceSet};
use crate::error::KernelError;
use crate::registry::{KernelDescriptor, Operation, RegistryBuilder, Utility};

use super::{line_spans, literal_hits};

pub const LINE_MATCH: Operation = Operation("line-match");

/// Kernel input: the whole file.
pub type Input = Arc<[u8]>;

/// A selected line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// 1-based line number.
    pub number: usize,
    /// Byte range of the line, newline excluded.
    pub range: Range<usize>,
}

pub type Output = Vec<LineMatch>;

#[derive(Debug, Clone, Default)]
pub struct GrepParams {
    pub patterns: Vec<String>,
    pub fixed: bool,
    pub ignore_case: bool,
    pub invert: bool,
}

/// Compiled patterns shared by every kernel.
#[derive(Debug, Clone)]
pub struct Matcher {
    regex: Regex,
    literals: Option<Vec<Vec<u8>>>,
    invert: bool,
}

impl GrepParams {
    pub fn compile(&self) -> Result<Matcher, regex::Error> {
        let alternatives: Vec<String> = self
            .patterns
            .iter()
            .map(|p| {
                if self.fixed {
                    regex::escape(p)
                } else {
                    format!("(?:{p})")
                }
            })
            .collect();
        let regex = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(self.ignore_case)
            .multi_line(false)
            .build()?;

        let literal = !self.ignore_case
            && !self.patterns.is_empty()
            && self
                .patterns
                .iter()
                .all(|p| !p.is_empty() && !p.contains('\n') && (self.fixed || !has_meta(p)));
        let literals = literal.then(|| self.patterns.iter().map(|p| p.as_bytes().to_vec()).collect());

        Ok(Matcher {
            regex,
            literals,
            invert: self.invert,
        })
    }
}

fn has_meta(pattern: &str) -> bool {
    pattern.chars().any(|c| r"\.+*?()|[]{}^$".contains(c))
}

impl Matcher {
    /// True when a substring kernel can stand in for the regex.
    pub fn is_literal(&self) -> bool {
        self.literals.is_some()
    }

    pub fn is_match(&self, line: &[u8]) -> bool {
        self.regex.is_match(line) != self.invert
    }
}

/// Regex per line.
pub fn cpu_line_match(matcher: &Matcher, data: &[u8]) -> Output {
    line_spans(data)
        .into_iter()
        .enumerate()
        .filter(|(_, span)| matcher.is_match(&data[span.clone()]))
        .map(|(i, range)| LineMatch { number: i + 1, range })
        .collect()
}

/// Tiled substring search over the whole buffer, hits mapped back to lines.
pub fn gpu_line_match(
    device: &ComputeDevice,
    matcher: &Matcher,
    data: &[u8],
) -> Result<Output, KernelError> {
    let literals = matcher
        .literals
        .as_deref()
        .ok_or_else(|| KernelError::UnsupportedInput("pattern is not a literal".into()))?;
    let overlap = literals.iter().map(|l| l.len()).max().unwrap_or(1) - 1;

    let tiles = device.dispatch(data.len(), overlap, |owned, visible| {
        let mut hits: Vec<usize> = literals
            .iter()
            .flat_map(|lit| literal_hits(data, lit, owned.clone(), visible.end))
            .collect();
        hits.sort_unstable();
        hits
    })?;

    let spans = line_spans(data);
    let mut hit_lines = vec![false; spans.len()];
    for offset in tiles.into_iter().flatten() {
        let line = spans.partition_point(|s| s.end < offset);
        if let Some(flag) = hit_lines.get_mut(line) {
            *flag = true;
        }
    }

    Ok(spans
        .into_iter()
        .zip(hit_lines)
        .enumerate()
        .filter(|(_, (_, hit))| *hit != matcher.invert)
        .map(|(i, (range, _))| LineMatch { number: i + 1, range })
        .collect())
}

/// Register the CPU kernel and, for literal patterns, one GPU kernel per
/// opened device.
pub fn register(builder: &mut RegistryBuilder<Input, Output>, matcher: &Matcher, devices: &DeviceSet) {
    let cpu = matcher.clone();
    builder.register(KernelDescriptor::new(
        Utility::Grep,
        LINE_MATCH,
        BackendKind::Cpu,
        move |data: &Input| Ok(cpu_line_match(&cpu, data)),
    ));

    if !matcher.is_literal() {
        log::debug!("grep: pattern is not literal, cpu kernel only");
        return;
    }
    for device in devices.iter() {
        let device = Arc::clone(device);
        let gpu = matcher.clone();
        builder.register(KernelDescriptor::new(
            Utility::Grep,
            LINE_MATCH,
            device.kind(),
            move |data: &Input| gpu_line_match(&device, &gpu, data),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceLimits;

    fn params(patterns: &[&str]) -> GrepParams {
        GrepParams {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn tiny_device() -> ComputeDevice {
        ComputeDevice::new(
            BackendKind::Metal,
            "tiny",
            DeviceLimits {
                max_buffer_len: 1 << 20,
                tile_len: 3,
            },
        )
    }

    #[test]
    fn literal_detection() {
        assert!(params(&["foo"]).compile().unwrap().is_literal());
        assert!(!params(&["fo+"]).compile().unwrap().is_literal());
        let mut p = params(&["a.b"]);
        p.fixed = true;
        assert!(p.compile().unwrap().is_literal());
        p.ignore_case = true;
        assert!(!p.compile().unwrap().is_literal());
    }

    #[test]
    fn cpu_numbers_lines() {
        let m = params(&["b"]).compile().unwrap();
        let out = cpu_line_match(&m, b"abc\nxyz\nbb");
        assert_eq!(
            out,
            vec![
                LineMatch { number: 1, range: 0..3 },
                LineMatch { number: 3, range: 8..10 },
            ]
        );
    }

    #[test]
    fn gpu_matches_across_tile_edges() {
        let m = params(&["needle", "xy"]).compile().unwrap();
        let data = b"hay\nhayneedlehay\nnothing\nxxy\nneedle";
        let dev = tiny_device();
        assert_eq!(gpu_line_match(&dev, &m, data).unwrap(), cpu_line_match(&m, data));
    }

    #[test]
    fn gpu_honours_invert() {
        let mut p = params(&["a"]);
        p.invert = true;
        let m = p.compile().unwrap();
        let data = b"a\nb\n\nca\n";
        let out = gpu_line_match(&tiny_device(), &m, data).unwrap();
        assert_eq!(out, cpu_line_match(&m, data));
        assert_eq!(out.iter().map(|l| l.number).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn gpu_kernels_only_for_literals() {
        let devices = DeviceSet::from_devices(vec![tiny_device()]);
        let mut b = RegistryBuilder::new();
        register(&mut b, &params(&["a|b"]).compile().unwrap(), &devices);
        let reg = b.build().unwrap();
        assert!(!reg.lookup(Utility::Grep, LINE_MATCH).unwrap().has_gpu());

        let mut b = RegistryBuilder::new();
        register(&mut b, &params(&["ab"]).compile().unwrap(), &devices);
        let reg = b.build().unwrap();
        assert!(reg.lookup(Utility::Grep, LINE_MATCH).unwrap().has_gpu());
    }
}
