#![no_main]
use libfuzzer_sys::fuzz_target;
use positronic::channels::telegram::split_message;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let max_chars = usize::from(data[0]).max(1);
    if let Ok(text) = std::str::from_utf8(&data[1..]) {
        let chunks = split_message(text, max_chars);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= max_chars);
        }
    }
});
