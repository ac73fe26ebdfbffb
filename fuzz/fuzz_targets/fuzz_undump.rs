#![no_main]

use libfuzzer_sys::fuzz_target;
use luma_bytecode::chunk::{undump, verify_tree};
use luma_core::string::StringInterner;

fuzz_target!(|data: &[u8]| {
    // Malformed chunks must be rejected with an error, never a panic.
    let mut strings = StringInterner::new();
    if let Ok(proto) = undump(data, "=fuzz", &mut strings) {
        let _ = verify_tree(&proto);
    }
});
