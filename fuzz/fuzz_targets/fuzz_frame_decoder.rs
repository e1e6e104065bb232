//! The ASP decoders must never panic on arbitrary link noise, in
//! either receive direction or mode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pumpsense::asp::{decode_buffer, Direction, FrameDecoder};

fuzz_target!(|data: &[u8]| {
    let mut to_ssm = FrameDecoder::new(Direction::ToSsm);
    let mut to_am = FrameDecoder::new(Direction::ToAm);
    for &byte in data {
        let _ = to_ssm.feed(byte);
        let _ = to_am.feed(byte);
    }
    let _ = decode_buffer(data, Direction::ToAm);
    let _ = decode_buffer(data, Direction::ToSsm);
});
