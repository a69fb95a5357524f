#![no_main]
use libfuzzer_sys::fuzz_target;
use treedelta::bsdiff::format;

fuzz_target!(|data: &[u8]| {
    let _ = format::apply_patch(&[], data);

    if data.len() >= 2 {
        let split = data.len() / 2;
        let (old, patch) = data.split_at(split);
        let _ = format::apply_patch(old, patch);
    }
});
