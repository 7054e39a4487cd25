use std::collections::HashMap;

use honggfuzz::fuzz;

use gpu_utils::kernels::awk::{self, FieldSep, Program};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            let Ok(src) = std::str::from_utf8(data) else {
                return;
            };
            if let Ok(program) = Program::parse(src, FieldSep::Blank, HashMap::new()) {
                let _ = awk::cpu_field_project(&program, b"a b c\n\nd e\n");
            }
        });
    }
}
