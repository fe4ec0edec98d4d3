//! API contract handle.
//!
//! A [`Contract`] is the subset of an OpenAPI 3.x document the pipeline
//! needs: declared servers, operations keyed by method and path template,
//! and the response schemas of each operation. Documents are loaded by
//! [`loader`].

pub mod loader;

use std::collections::BTreeMap;

use http::Method;
use serde_json::Value;
use thiserror::Error;

pub use loader::{check_origin, load};

/// HTTP methods an OpenAPI path item may declare.
const PATH_ITEM_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read spec file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch spec from '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("failed to parse spec document: {0}")]
    Parse(String),

    #[error("invalid spec: {0}")]
    Invalid(String),
}

/// Declared responses for one status key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSpec {
    /// Media type to optional schema.
    pub content: BTreeMap<String, Option<Value>>,
}

/// One documented method + path template.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub method: Method,
    pub path_template: String,
    /// Keyed by `"200"`, `"2XX"` or `"default"`.
    pub responses: BTreeMap<String, ResponseSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct Contract {
    version: String,
    servers: Vec<String>,
    operations: Vec<Operation>,
    components: Value,
}

impl Contract {
    /// Build a contract from an OpenAPI 3.x document already parsed to JSON.
    pub fn from_document(doc: Value) -> Result<Self, ContractError> {
        let root = doc
            .as_object()
            .ok_or_else(|| ContractError::Invalid("document is not an object".into()))?;

        if root.contains_key("swagger") {
            return Err(ContractError::Invalid(
                "Swagger 2.0 documents are not supported, use OpenAPI 3.x".into(),
            ));
        }
        let version = root
            .get("openapi")
            .and_then(Value::as_str)
            .ok_or_else(|| ContractError::Invalid("missing 'openapi' version field".into()))?
            .to_string();
        if !version.starts_with("3.") {
            return Err(ContractError::Invalid(format!(
                "unsupported OpenAPI version '{version}'"
            )));
        }

        let servers = root
            .get("servers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|s| s.get("url").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let components = root.get("components").cloned().unwrap_or(Value::Null);

        let paths = root
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| ContractError::Invalid("missing 'paths' object".into()))?;

        let mut operations = Vec::new();
        for (template, item) in paths {
            if !template.starts_with('/') {
                return Err(ContractError::Invalid(format!(
                    "path '{template}' must start with '/'"
                )));
            }
            let Some(item) = item.as_object() else {
                continue;
            };
            for method in PATH_ITEM_METHODS {
                let Some(op) = item.get(method) else {
                    continue;
                };
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| ContractError::Invalid(e.to_string()))?;
                let id = op
                    .get("operationId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{method} {template}"));
                let responses = parse_responses(op.get("responses"), &components)?;

                operations.push(Operation {
                    id,
                    method,
                    path_template: template.clone(),
                    responses,
                });
            }
        }

        Ok(Self {
            version,
            servers,
            operations,
            components,
        })
    }

    /// The `openapi` field, e.g. `"3.0.3"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Documents older than 3.1 use draft-04 style schemas.
    pub fn is_openapi_30(&self) -> bool {
        self.version.starts_with("3.0")
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Replace the declared server locations.
    pub fn set_servers(&mut self, servers: Vec<String>) {
        self.servers = servers;
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn components(&self) -> &Value {
        &self.components
    }

    /// Path component of the first server, without a trailing slash.
    pub fn base_path(&self) -> String {
        let Some(server) = self.servers.first() else {
            return String::new();
        };
        let path = match url::Url::parse(server) {
            Ok(url) => url.path().to_string(),
            Err(_) => server.clone(),
        };
        path.trim_end_matches('/').to_string()
    }
}

/// Resolve a `#/components/...` reference against `components`.
pub(crate) fn resolve_component<'a>(components: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix("#/components")?;
    components.pointer(pointer)
}

fn parse_responses(
    responses: Option<&Value>,
    components: &Value,
) -> Result<BTreeMap<String, ResponseSpec>, ContractError> {
    let mut out = BTreeMap::new();
    let Some(responses) = responses.and_then(Value::as_object) else {
        return Ok(out);
    };

    for (status, response) in responses {
        let response = match response.get("$ref").and_then(Value::as_str) {
            Some(reference) => resolve_component(components, reference).ok_or_else(|| {
                ContractError::Invalid(format!("unresolved response reference '{reference}'"))
            })?,
            None => response,
        };

        let mut spec = ResponseSpec::default();
        if let Some(content) = response.get("content").and_then(Value::as_object) {
            for (media_type, media) in content {
                spec.content
                    .insert(media_type.to_ascii_lowercase(), media.get("schema").cloned());
            }
        }
        let key = if status.eq_ignore_ascii_case("default") {
            "default".to_string()
        } else {
            status.to_ascii_uppercase()
        };
        out.insert(key, spec);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn petstore() -> Value {
        json!({
            "openapi": "3.0.3",
            "info": {"title": "Pets", "version": "1.0.0"},
            "servers": [{"url": "https://api.example.com/v1"}],
            "paths": {
                "/pets": {
                    "get": {
                        "operationId": "listPets",
                        "responses": {
                            "200": {
                                "description": "ok",
                                "content": {"application/json": {"schema": {
                                    "type": "array",
                                    "items": {"$ref": "#/components/schemas/Pet"}
                                }}}
                            }
                        }
                    },
                    "post": {
                        "responses": {"201": {"$ref": "#/components/responses/Created"}}
                    }
                },
                "/pets/{petId}": {
                    "parameters": [{"name": "petId", "in": "path", "required": true}],
                    "get": {
                        "operationId": "showPet",
                        "responses": {
                            "200": {
                                "description": "ok",
                                "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Pet"}}}
                            },
                            "4XX": {
                                "description": "client error",
                                "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Error"}}}
                            },
                            "default": {"description": "anything else"}
                        }
                    }
                },
                "/pets/mine": {
                    "get": {
                        "operationId": "myPets",
                        "responses": {"200": {"description": "ok"}}
                    }
                }
            },
            "components": {
                "schemas": {
                    "Pet": {
                        "type": "object",
                        "required": ["id", "name"],
                        "properties": {
                            "id": {"type": "integer"},
                            "name": {"type": "string"},
                            "tag": {"type": "string", "nullable": true}
                        }
                    },
                    "Error": {
                        "type": "object",
                        "required": ["message"],
                        "properties": {"message": {"type": "string"}}
                    }
                },
                "responses": {
                    "Created": {
                        "description": "created",
                        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Pet"}}}
                    }
                }
            }
        })
    }

    #[test]
    fn test_from_document_extracts_operations() {
        let contract = Contract::from_document(petstore()).unwrap();

        assert_eq!(contract.version(), "3.0.3");
        assert!(contract.is_openapi_30());
        assert_eq!(contract.operations().len(), 4);

        let show = contract.operation("showPet").unwrap();
        assert_eq!(show.method, Method::GET);
        assert_eq!(show.path_template, "/pets/{petId}");
        assert_eq!(
            show.responses.keys().collect::<Vec<_>>(),
            vec!["200", "4XX", "default"]
        );
        assert!(show.responses["default"].content.is_empty());
    }

    #[test]
    fn test_operation_id_falls_back_to_method_and_path() {
        let contract = Contract::from_document(petstore()).unwrap();
        let create = contract.operation("POST /pets").unwrap();

        assert_eq!(create.method, Method::POST);
        assert!(create.responses["201"].content["application/json"].is_some());
    }

    #[test]
    fn test_base_path_and_server_override() {
        let mut contract = Contract::from_document(petstore()).unwrap();
        assert_eq!(contract.base_path(), "/v1");

        contract.set_servers(vec!["http://localhost:3000".into()]);
        assert_eq!(contract.servers(), ["http://localhost:3000"]);
        assert_eq!(contract.base_path(), "");

        contract.set_servers(vec!["/api/".into()]);
        assert_eq!(contract.base_path(), "/api");
    }

    #[test]
    fn test_rejects_non_openapi3_documents() {
        let swagger = json!({"swagger": "2.0", "paths": {}});
        assert!(matches!(
            Contract::from_document(swagger),
            Err(ContractError::Invalid(_))
        ));

        let no_paths = json!({"openapi": "3.1.0"});
        assert!(Contract::from_document(no_paths)
            .unwrap_err()
            .to_string()
            .contains("paths"));
    }

    #[test]
    fn test_unresolved_response_ref_is_invalid() {
        let doc = json!({
            "openapi": "3.1.0",
            "paths": {"/x": {"get": {"responses": {"200": {"$ref": "#/components/responses/Missing"}}}}}
        });
        let err = Contract::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }
}
