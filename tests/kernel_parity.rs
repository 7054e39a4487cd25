//! GPU kernels must produce exactly what the CPU kernels produce.

use std::collections::HashMap;
use std::path::PathBuf;

use gpu_utils::device::{ComputeDevice, DeviceLimits};
use gpu_utils::kernels::awk::{self, FieldSep, Program};
use gpu_utils::kernels::find::{self, Entry, EntryType, Expression};
use gpu_utils::kernels::grep::{self, GrepParams};
use gpu_utils::kernels::sed::{self, Script};
use gpu_utils::BackendKind;
use quickcheck::{quickcheck, TestResult};
use rand::{Rng, SeedableRng};

fn device(tile_len: usize) -> ComputeDevice {
    ComputeDevice::new(
        BackendKind::Metal,
        "parity",
        DeviceLimits {
            max_buffer_len: 1 << 20,
            tile_len: tile_len.max(1),
        },
    )
}

/// Text over a small alphabet so literals actually hit.
fn text_from(bytes: &[u8]) -> Vec<u8> {
    const ALPHABET: &[u8] = b"ab c\n";
    bytes.iter().map(|b| ALPHABET[*b as usize % ALPHABET.len()]).collect()
}

quickcheck! {
    fn grep_literal_parity(raw: Vec<u8>, needle: Vec<u8>, invert: bool, tile: u8) -> TestResult {
        let needle: String = String::from_utf8(text_from(&needle))
            .unwrap_or_default()
            .replace('\n', "");
        if needle.is_empty() || needle.len() > 4 {
            return TestResult::discard();
        }
        let params = GrepParams {
            patterns: vec![needle],
            fixed: true,
            ignore_case: false,
            invert,
        };
        let matcher = params.compile().unwrap();
        let data = text_from(&raw);
        let gpu = grep::gpu_line_match(&device(tile as usize % 17), &matcher, &data).unwrap();
        TestResult::from_bool(gpu == grep::cpu_line_match(&matcher, &data))
    }

    fn sed_literal_parity(raw: Vec<u8>, global: bool, tile: u8) -> bool {
        let flag = if global { "g" } else { "" };
        let script = Script::parse(&format!("s/ab/<&>/{flag};s/c/cc/"), false, false).unwrap();
        assert!(script.is_literal());
        let data = text_from(&raw);
        let gpu = sed::gpu_stream_edit(&device(tile as usize % 23), &script, &data).unwrap();
        gpu == sed::cpu_stream_edit(&script, &data)
    }

    fn awk_projection_parity(raw: Vec<u8>, tile: u8) -> bool {
        let program = Program::parse(
            "{ print NR, $NF, $1 }\nNR==3 { print \"third\", NF }",
            FieldSep::Blank,
            HashMap::new(),
        )
        .unwrap();
        let data = text_from(&raw);
        let gpu = awk::gpu_field_project(&device(tile as usize % 19), &program, &data).unwrap();
        gpu == awk::cpu_field_project(&program, &data)
    }
}

#[test]
fn find_filter_parity_on_random_trees() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let names = ["main.rs", "lib.RS", "notes.txt", "a", "b.tar.gz", "Makefile"];
    let entries: Vec<Entry> = (0..5000)
        .map(|i| {
            let depth = rng.gen_range(0..5);
            let name = names[rng.gen_range(0..names.len())];
            let file_type = match rng.gen_range(0..3) {
                0 => EntryType::Dir,
                1 => EntryType::File,
                _ => EntryType::Symlink,
            };
            Entry {
                path: PathBuf::from(format!("./d{depth}/{i}-{name}")),
                file_type,
                depth,
            }
        })
        .collect();

    for expr in [
        vec!["-name", "*.rs"],
        vec!["-iname", "*.rs", "-type", "f"],
        vec!["-type", "l"],
        vec!["-name", "*[0-9]-?"],
    ] {
        let args: Vec<String> = expr.iter().map(|s| s.to_string()).collect();
        let (_, expr) = Expression::parse(&args).unwrap();
        let gpu = find::gpu_entry_filter(&device(64), &expr, &entries).unwrap();
        assert_eq!(gpu, find::cpu_entry_filter(&expr, &entries));
    }
}
