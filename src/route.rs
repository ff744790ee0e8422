//! Route extraction from API definitions

use crate::error::PlaygroundError;
use serde_json::Value;

/// Extract the path the gateway will answer on from an API definition.
///
/// Only `proxy.listen_path` is read; the rest of the document is not checked
/// against any schema.
pub fn extract_route_path(def: &str) -> Result<String, PlaygroundError> {
    let doc: Value = serde_json::from_str(def).map_err(|_| {
        PlaygroundError::InvalidInput("the API definition is not valid JSON".to_string())
    })?;

    match doc.pointer("/proxy/listen_path").and_then(Value::as_str) {
        Some(path) if !path.is_empty() => Ok(path.to_string()),
        _ => Err(PlaygroundError::MissingRoute),
    }
}
