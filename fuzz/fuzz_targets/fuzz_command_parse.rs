#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Some(parsed) = positronic::commands::parse_command(text) {
            assert!(parsed.command.starts_with('/'));
            assert!(parsed.command.len() <= 33);
        }
    }
});
