//! Schema validation of buffered responses.
//!
//! [`SchemaValidator`] is the seam the pipeline calls after a route is
//! resolved. [`JsonSchemaValidator`] is the reference implementation over a
//! [`Contract`], backed by the `jsonschema` crate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::contract::{Contract, ContractError, Operation, resolve_component};

/// Schemas nested deeper than this are replaced by `{}`.
const MAX_SCHEMA_DEPTH: usize = 50;

/// Keywords whose value maps names to subschemas.
const SCHEMA_MAP_KEYWORDS: [&str; 5] = [
    "properties",
    "patternProperties",
    "$defs",
    "definitions",
    "dependentSchemas",
];

/// Redirect and not-modified responses carry no documented body.
const NEVER_VALIDATED_STATUSES: [u16; 4] = [301, 304, 307, 308];

/// Keywords whose value is data, not schema.
const LITERAL_KEYWORDS: [&str; 5] = ["example", "examples", "enum", "const", "default"];

/// Contract violation. `detail` describes every violation found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct ValidationError {
    pub detail: String,
}

impl ValidationError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Everything a validator may look at for one response.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub operation_id: &'a str,
    pub path_params: &'a [(String, String)],
    pub request_headers: &'a HeaderMap,
    pub status: StatusCode,
    pub response_headers: &'a HeaderMap,
    pub body: &'a Bytes,
}

/// Checks a response against a resolved operation.
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate(&self, input: ValidationInput<'_>) -> Result<(), ValidationError>;
}

type SchemaKey = (String, String, String);

/// Validator with every response schema compiled up front.
pub struct JsonSchemaValidator {
    operations: HashMap<String, Operation>,
    /// Keyed by (operation id, status key, media type).
    compiled: HashMap<SchemaKey, Arc<jsonschema::Validator>>,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("operations", &self.operations.len())
            .field("schemas", &self.compiled.len())
            .finish()
    }
}

impl JsonSchemaValidator {
    pub fn new(contract: &Contract) -> Result<Self, ContractError> {
        let draft4 = contract.is_openapi_30();
        let mut operations = HashMap::new();
        let mut compiled = HashMap::new();

        for op in contract.operations() {
            for (status_key, response) in &op.responses {
                for (media_type, schema) in &response.content {
                    let Some(schema) = schema else {
                        continue;
                    };
                    let prepared = prepare_schema(schema, contract.components(), draft4)?;
                    let validator = if draft4 {
                        jsonschema::draft4::new(&prepared)
                    } else {
                        jsonschema::draft202012::new(&prepared)
                    }
                    .map_err(|e| {
                        ContractError::Invalid(format!(
                            "schema for {} {status_key} {media_type}: {e}",
                            op.id
                        ))
                    })?;
                    compiled.insert(
                        (op.id.clone(), status_key.clone(), media_type.clone()),
                        Arc::new(validator),
                    );
                }
            }
            operations.insert(op.id.clone(), op.clone());
        }

        Ok(Self {
            operations,
            compiled,
        })
    }
}

#[async_trait]
impl SchemaValidator for JsonSchemaValidator {
    async fn validate(&self, input: ValidationInput<'_>) -> Result<(), ValidationError> {
        let Some(op) = self.operations.get(input.operation_id) else {
            tracing::warn!(
                operation_id = input.operation_id,
                "Operation not in contract, response not validated"
            );
            return Ok(());
        };

        let code = input.status.as_u16();
        if NEVER_VALIDATED_STATUSES.contains(&code) {
            return Ok(());
        }
        // Statuses the operation does not document are not checked.
        let Some(status_key) = select_status(op, code) else {
            return Ok(());
        };
        let response = &op.responses[status_key];
        if response.content.is_empty() {
            return Ok(());
        }

        let content_type = input
            .response_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let Some(media_type) = select_media(response.content.keys(), &essence) else {
            return Err(ValidationError::new(format!(
                "response Content-Type \"{content_type}\" is not declared for status {code}"
            )));
        };

        let key = (op.id.clone(), status_key.to_string(), media_type.to_string());
        let Some(schema) = self.compiled.get(&key) else {
            return Ok(());
        };

        // Parsing and schema checks are CPU-bound; on the blocking pool they
        // stay abandonable by the caller's deadline and cancellation.
        let schema = Arc::clone(schema);
        let body = input.body.clone();
        match tokio::task::spawn_blocking(move || check_body(&schema, &body)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    operation_id = input.operation_id,
                    error = %e,
                    "Schema check did not complete, response not validated"
                );
                Ok(())
            }
        }
    }
}

/// Exact code, then `NXX`, then `default`.
fn select_status(op: &Operation, code: u16) -> Option<&str> {
    let exact = code.to_string();
    let range = format!("{}XX", code / 100);
    [exact.as_str(), range.as_str(), "default"]
        .into_iter()
        .find_map(|k| op.responses.get_key_value(k).map(|(key, _)| key.as_str()))
}

/// Exact media type, then `type/*`, then `*/*`.
fn select_media<'a>(
    declared: impl Iterator<Item = &'a String> + Clone,
    essence: &str,
) -> Option<&'a str> {
    let wildcard = essence
        .split('/')
        .next()
        .map(|t| format!("{t}/*"))
        .unwrap_or_default();
    [essence, wildcard.as_str(), "*/*"].into_iter().find_map(|want| {
        declared
            .clone()
            .find(|m| m.as_str() == want)
            .map(String::as_str)
    })
}

/// Make a response schema compile standalone.
///
/// `#/components/schemas/<name>` references are pointed at a copy of the
/// component under the draft's definitions keyword, so shared and recursive
/// types are compiled once and checked at every depth. OpenAPI-only keywords
/// are rewritten along the way.
fn prepare_schema(
    schema: &Value,
    components: &Value,
    draft4: bool,
) -> Result<Value, ContractError> {
    let mut preparer = SchemaPreparer::new(components, draft4);
    let root = preparer.prepare(schema, 0, &mut Vec::new())?;
    preparer.finish(root)
}

struct SchemaPreparer<'a> {
    components: &'a Value,
    defs_keyword: &'static str,
    defs: Map<String, Value>,
    /// Component names referenced so far, prepared or not.
    seen: HashSet<String>,
    pending: Vec<String>,
}

impl<'a> SchemaPreparer<'a> {
    fn new(components: &'a Value, draft4: bool) -> Self {
        Self {
            components,
            defs_keyword: if draft4 { "definitions" } else { "$defs" },
            defs: Map::new(),
            seen: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Prepare every referenced component and attach them to `root`.
    fn finish(mut self, root: Value) -> Result<Value, ContractError> {
        let components = self.components;
        while let Some(name) = self.pending.pop() {
            let target = components
                .get("schemas")
                .and_then(|schemas| schemas.get(&name))
                .ok_or_else(|| {
                    ContractError::Invalid(format!("unresolved schema reference '{name}'"))
                })?;
            let prepared = self.prepare(target, 0, &mut Vec::new())?;
            self.defs.insert(name, prepared);
        }

        if self.defs.is_empty() {
            return Ok(root);
        }
        let mut wrapper = Map::with_capacity(2);
        wrapper.insert("allOf".to_string(), Value::Array(vec![root]));
        wrapper.insert(self.defs_keyword.to_string(), Value::Object(self.defs));
        Ok(Value::Object(wrapper))
    }

    /// `expanding` holds the non-schema component references currently being
    /// inlined. Such a reference met again inside its own expansion becomes
    /// `{}`.
    fn prepare(
        &mut self,
        schema: &Value,
        depth: usize,
        expanding: &mut Vec<String>,
    ) -> Result<Value, ContractError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Ok(json!({}));
        }

        let Value::Object(obj) = schema else {
            return Ok(match schema {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|v| self.prepare(v, depth + 1, expanding))
                        .collect::<Result<_, _>>()?,
                ),
                other => other.clone(),
            });
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            if reference.starts_with("#/components/") {
                let target = resolve_component(self.components, reference).ok_or_else(|| {
                    ContractError::Invalid(format!("unresolved schema reference '{reference}'"))
                })?;
                if let Some(token) = reference
                    .strip_prefix("#/components/schemas/")
                    .filter(|token| !token.contains('/'))
                {
                    let name = token.replace("~1", "/").replace("~0", "~");
                    if self.seen.insert(name.clone()) {
                        self.pending.push(name);
                    }
                    return Ok(json!({"$ref": format!("#/{}/{token}", self.defs_keyword)}));
                }
                if expanding.iter().any(|r| r == reference) {
                    return Ok(json!({}));
                }
                expanding.push(reference.to_string());
                let prepared = self.prepare(target, depth + 1, expanding);
                expanding.pop();
                return prepared;
            }
        }

        let mut out = Map::with_capacity(obj.len());
        for (key, value) in obj {
            let key_str = key.as_str();
            if key_str == "nullable" {
                continue;
            }
            let prepared = if LITERAL_KEYWORDS.contains(&key_str) {
                value.clone()
            } else if SCHEMA_MAP_KEYWORDS.contains(&key_str) {
                match value {
                    Value::Object(entries) => {
                        let mut map = Map::with_capacity(entries.len());
                        for (name, sub) in entries {
                            map.insert(name.clone(), self.prepare(sub, depth + 1, expanding)?);
                        }
                        Value::Object(map)
                    }
                    other => other.clone(),
                }
            } else {
                self.prepare(value, depth + 1, expanding)?
            };
            out.insert(key.clone(), prepared);
        }

        let prepared = Value::Object(out);
        if obj.get("nullable").and_then(Value::as_bool) == Some(true) {
            Ok(json!({"anyOf": [prepared, {"type": "null"}]}))
        } else {
            Ok(prepared)
        }
    }
}

/// Parse `body` and collect every violation of `schema`.
fn check_body(schema: &jsonschema::Validator, body: &[u8]) -> Result<(), ValidationError> {
    let instance: Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::new(format!("response body is not valid JSON: {e}")))?;

    let violations: Vec<String> = schema
        .iter_errors(&instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            let path = if path.is_empty() { "/".to_string() } else { path };
            format!("{path}: {e}")
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(violations.join("; ")))
    }
}
