use honggfuzz::fuzz;

use gpu_utils::kernels::sed::{self, Script};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            let Ok(src) = std::str::from_utf8(data) else {
                return;
            };
            for extended in [false, true] {
                if let Ok(script) = Script::parse(src, extended, false) {
                    let _ = sed::cpu_stream_edit(&script, b"alpha beta\ngamma\n");
                }
            }
        });
    }
}
