#![no_main]
use std::ops::ControlFlow;

use libfuzzer_sys::fuzz_target;
use treedelta::archive::{ArchiveError, ArchiveReader};
use treedelta::command::CommandFlags;

fuzz_target!(|data: &[u8]| {
    // Arbitrary archives must decode to an error, never a panic.
    let Ok(reader) = ArchiveReader::new(data) else {
        return;
    };
    let _ = reader.for_each_command(|item| -> Result<_, ArchiveError> {
        if item.flags().contains(CommandFlags::BINARY_DIFF) {
            let _ = item.read_diff()?;
        } else if item.content_len().is_some() {
            item.copy_to(&mut std::io::sink())?;
        }
        Ok(ControlFlow::Continue(()))
    });
});
