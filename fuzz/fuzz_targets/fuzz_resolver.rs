#![no_main]

//! Resolve arbitrary request paths against a fixed contract.

use std::sync::OnceLock;

use http::{HeaderMap, Method, Uri};
use libfuzzer_sys::fuzz_target;
use serde_json::json;
use specgate::contract::Contract;
use specgate::resolver::{OperationResolver, RequestHead, TemplateResolver};

fn resolver() -> &'static TemplateResolver {
    static RESOLVER: OnceLock<TemplateResolver> = OnceLock::new();
    RESOLVER.get_or_init(|| {
        let doc = json!({
            "openapi": "3.0.3",
            "servers": [{"url": "https://api.example.com/v1"}],
            "paths": {
                "/pets": {"get": {"operationId": "listPets", "responses": {}}},
                "/pets/mine": {"get": {"operationId": "myPets", "responses": {}}},
                "/pets/{petId}": {"get": {"operationId": "showPet", "responses": {}}},
                "/owners/{ownerId}/pets/{petId}": {
                    "delete": {"operationId": "removePet", "responses": {}}
                }
            }
        });
        let contract = Contract::from_document(doc).expect("fixed contract is valid");
        TemplateResolver::new(&contract).expect("fixed templates compile")
    })
}

fuzz_target!(|data: (bool, &str)| {
    let (delete, path) = data;
    let Ok(uri) = path.parse::<Uri>() else {
        return;
    };
    let method = if delete { Method::DELETE } else { Method::GET };
    let head = RequestHead::new(method, uri, HeaderMap::new());

    if let Ok(route) = resolver().resolve(&head) {
        assert!(!route.operation_id.is_empty());
        for (_, value) in &route.path_params {
            assert!(!value.is_empty());
            assert!(!value.contains('/'));
        }
    }
});
