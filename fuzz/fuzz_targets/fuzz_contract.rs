#![no_main]

//! Parse arbitrary text as a contract document.
//!
//! Must not panic on malformed YAML, JSON or OpenAPI structure, and every
//! contract that loads must also build a resolver.

use libfuzzer_sys::fuzz_target;
use specgate::contract::{Contract, loader::parse_document};
use specgate::resolver::TemplateResolver;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    for name in ["fuzz.yaml", "fuzz.json"] {
        let Ok(doc) = parse_document(name, text) else {
            continue;
        };
        if let Ok(contract) = Contract::from_document(doc) {
            let _ = contract.base_path();
            let _ = TemplateResolver::new(&contract);
        }
    }
});
