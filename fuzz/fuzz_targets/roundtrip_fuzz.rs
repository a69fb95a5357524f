#![no_main]
use libfuzzer_sys::fuzz_target;
use treedelta::bsdiff::{self, format};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte picks the split point between old and new.
    let split = usize::from(data[0]) * (data.len() - 1) / 255;
    let (old, new) = data[1..].split_at(split);

    let record = bsdiff::diff(old, new);
    assert_eq!(record.apply(old).unwrap(), new);

    let mut patch = Vec::new();
    format::write_patch(&mut patch, &record).unwrap();
    assert_eq!(format::apply_patch(old, &patch).unwrap(), new);
});
