//! Loading contract documents from disk or over HTTP.

use std::time::Duration;

use serde_json::Value;
use url::Url;

use super::{Contract, ContractError};
use crate::error::ConfigError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns `true` for `http://` and `https://` locations.
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Load and parse the contract at `location` (a URL or a file path).
pub async fn load(location: &str) -> Result<Contract, ContractError> {
    let text = if is_remote(location) {
        fetch(location).await?
    } else {
        tokio::fs::read_to_string(location)
            .await
            .map_err(|source| ContractError::Read {
                path: location.to_string(),
                source,
            })?
    };

    let doc = parse_document(location, &text)?;
    Contract::from_document(doc)
}

async fn fetch(url: &str) -> Result<String, ContractError> {
    let fetch_err = |reason: String| ContractError::Fetch {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| fetch_err(e.to_string()))?;

    client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| fetch_err(e.to_string()))?
        .text()
        .await
        .map_err(|e| fetch_err(e.to_string()))
}

/// Parse `text` as JSON when `name` ends in `.json` or the text is an
/// object literal, otherwise as YAML.
pub fn parse_document(name: &str, text: &str) -> Result<Value, ContractError> {
    let looks_json = name
        .split(['?', '#'])
        .next()
        .is_some_and(|path| path.to_ascii_lowercase().ends_with(".json"))
        || text.trim_start().starts_with('{');

    if looks_json {
        return serde_json::from_str(text).map_err(|e| ContractError::Parse(e.to_string()));
    }

    // serde_json stringifies integer mapping keys such as `200:`.
    let yaml: serde_yml::Value =
        serde_yml::from_str(text).map_err(|e| ContractError::Parse(e.to_string()))?;
    serde_json::to_value(yaml).map_err(|e| ContractError::Parse(e.to_string()))
}

/// Refuse a remote contract served from a different origin than the upstream.
///
/// Origins compare scheme, host and port. File paths always pass.
pub fn check_origin(spec_location: &str, upstream: &str) -> Result<(), ConfigError> {
    if !is_remote(spec_location) {
        return Ok(());
    }

    let spec = Url::parse(spec_location).map_err(|e| ConfigError::InvalidSpecUrl {
        url: spec_location.to_string(),
        reason: e.to_string(),
    })?;
    let target = Url::parse(upstream).map_err(|e| ConfigError::InvalidUpstream {
        url: upstream.to_string(),
        reason: e.to_string(),
    })?;

    if spec.origin() != target.origin() {
        return Err(ConfigError::OriginMismatch {
            spec: spec.origin().ascii_serialization(),
            upstream: target.origin().ascii_serialization(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PETS_YAML: &str = r#"
openapi: 3.0.3
info:
  title: Pets
  version: 1.0.0
servers:
  - url: http://localhost:3000
paths:
  /pets/{petId}:
    get:
      operationId: showPet
      responses:
        200:
          description: ok
          content:
            application/json:
              schema:
                type: object
                required: [id]
                properties:
                  id:
                    type: integer
                    minimum: 1
        404:
          description: missing
"#;

    fn temp_spec(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_yaml_with_integer_status_keys() {
        let file = temp_spec(".yaml", PETS_YAML);

        let contract = load(file.path().to_str().unwrap()).await.unwrap();

        let op = contract.operation("showPet").unwrap();
        assert_eq!(op.responses.keys().collect::<Vec<_>>(), vec!["200", "404"]);
        assert_eq!(contract.servers(), ["http://localhost:3000"]);
    }

    #[tokio::test]
    async fn test_load_json_document() {
        let file = temp_spec(
            ".json",
            r#"{"openapi":"3.1.0","paths":{"/health":{"get":{"responses":{"204":{"description":"ok"}}}}}}"#,
        );

        let contract = load(file.path().to_str().unwrap()).await.unwrap();
        assert!(contract.operation("GET /health").is_some());
        assert!(!contract.is_openapi_30());
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");

        let err = load(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, ContractError::Read { .. }));
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        assert!(matches!(
            parse_document("spec.yaml", "paths: [unclosed"),
            Err(ContractError::Parse(_))
        ));
        assert!(matches!(
            parse_document("spec.json", "{\"openapi\": "),
            Err(ContractError::Parse(_))
        ));
    }

    #[test]
    fn test_json_detected_by_content() {
        let doc = parse_document("spec", "  {\"openapi\": \"3.0.0\"}").unwrap();
        assert_eq!(doc["openapi"], "3.0.0");
    }

    #[test]
    fn test_check_origin() {
        assert!(check_origin("./openapi.yaml", "http://localhost:3000").is_ok());
        assert!(check_origin(
            "http://localhost:3000/openapi.json",
            "http://localhost:3000"
        )
        .is_ok());
        assert!(check_origin("https://api.example.com/spec", "https://api.example.com:443").is_ok());

        let err = check_origin("https://docs.example.com/spec.yaml", "https://api.example.com")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "spec URL (https://docs.example.com) does not match upstream URL (https://api.example.com)"
        );

        assert!(matches!(
            check_origin("http://localhost:3000/spec", "http://localhost:4000"),
            Err(ConfigError::OriginMismatch { .. })
        ));
    }
}
