//! Fuzz target for SseDecoder chunk handling
//!
//! # Strategy
//!
//! - Decode the whole stream in one feed
//! - Decode the same bytes split at arbitrary offsets
//!
//! # Invariants
//!
//! - Chunk boundaries never change the dispatched messages (CRLF split across
//!   two chunks included)
//! - Final `id` and `retry` state is the same

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nereo_client::SseDecoder;

#[derive(Debug, Arbitrary)]
struct Input {
    stream: Vec<u8>,
    splits: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut whole = SseDecoder::new();
    let expected = whole.feed(&input.stream);

    let mut chunked = SseDecoder::new();
    let mut messages = Vec::new();
    let mut rest = input.stream.as_slice();
    for split in input.splits {
        let at = usize::from(split).min(rest.len());
        let (chunk, tail) = rest.split_at(at);
        messages.extend(chunked.feed(chunk));
        rest = tail;
    }
    messages.extend(chunked.feed(rest));

    assert_eq!(messages, expected);
    assert_eq!(chunked.last_event_id(), whole.last_event_id());
    assert_eq!(chunked.retry(), whole.retry());
});
