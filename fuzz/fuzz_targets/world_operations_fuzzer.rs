//! Fuzz target for the simulated world
//!
//! Drives channels, pushes, refetches and writes with arbitrary operation
//! sequences and checks the standard invariants after every step.
//!
//! # Invariants
//!
//! - One live transport per connecting or connected channel
//! - A disconnected channel always has a timer within the backoff horizon
//! - Pushes never create cache entries
//! - Rolled back writes restore their snapshots, one notice each

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nereo_harness::{Operation, SimWorld};

#[derive(Debug, Arbitrary)]
struct Input {
    seed: u64,
    ops: Vec<Operation>,
}

fuzz_target!(|input: Input| {
    let mut world = SimWorld::standard(input.seed);

    for op in &input.ops {
        world.apply(op);
        if let Err(violations) = world.check_invariants() {
            panic!("invariants violated after {op:?}: {violations:?}");
        }
    }

    while world.settle_next().is_some() {}
    assert_eq!(world.snapshot().pending_writes, 0);
});
