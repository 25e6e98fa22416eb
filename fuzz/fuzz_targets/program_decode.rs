//! Fuzz harness for the filter-program intake pipeline.
//!
//! Exercises `decode_program` and `check_program` with arbitrary byte
//! sequences, ensuring no panics on truncated streams, oversized
//! programs, or hostile opcodes, and that any accepted decode re-encodes
//! to the exact input bytes (the encoding is an external ABI).

#![no_main]

use libfuzzer_sys::fuzz_target;
use sysgate_core::program::{check_program, decode_program};

fuzz_target!(|data: &[u8]| {
    let Ok(insns) = decode_program(data) else {
        return;
    };
    let _ = check_program(&insns);

    let reencoded: Vec<u8> = insns.iter().flat_map(|insn| insn.encode()).collect();
    assert_eq!(reencoded, data);
});
