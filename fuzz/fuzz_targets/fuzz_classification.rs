#![no_main]

//! Mode parsing and resolver-message classification on arbitrary input.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use specgate::guard::is_json;
use specgate::parse_mode;
use specgate::resolver::{ResolveError, is_undocumented_message};

#[derive(Arbitrary, Debug)]
struct Input {
    mode: String,
    message: String,
    content_type: String,
}

fuzz_target!(|input: Input| {
    if let Ok(mode) = parse_mode(&input.mode) {
        // Accepted names round-trip through their canonical form.
        assert_eq!(parse_mode(mode.as_str()).ok(), Some(mode));
        assert!(input.mode.eq_ignore_ascii_case(mode.as_str()));
    }

    let undocumented = is_undocumented_message(&input.message);
    assert_eq!(
        undocumented,
        ResolveError::Other(input.message.clone()).is_undocumented()
    );
    assert_eq!(
        undocumented,
        is_undocumented_message(&input.message.to_ascii_uppercase())
    );

    let _ = is_json(&input.content_type);
});
