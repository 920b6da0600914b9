//! Request payload schemas.
//!
//! Bodies are checked against a JSON Schema before being deserialized, so
//! clients get every violation at once in the error message.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::error::ApiError;

pub(crate) struct Schemas {
    validators: HashMap<&'static str, jsonschema::Validator>,
}

impl Schemas {
    pub(crate) fn compile() -> Result<Self, String> {
        let mut validators = HashMap::new();
        for (name, schema) in definitions() {
            let validator = jsonschema::validator_for(&schema)
                .map_err(|e| format!("failed to compile schema '{name}': {e}"))?;
            validators.insert(name, validator);
        }
        Ok(Self { validators })
    }

    /// Parse `body` as JSON and check it against schema `name`.
    pub(crate) fn validate(&self, name: &str, body: &[u8]) -> Result<Value, ApiError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidBody(format!("body is not valid JSON: {e}")))?;
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ApiError::InvalidBody(format!("no schema for '{name}'")))?;
        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| format!("{e}"))
            .collect();
        if errors.is_empty() {
            Ok(value)
        } else {
            Err(ApiError::InvalidBody(errors.join("; ")))
        }
    }

    pub(crate) fn parse<T: DeserializeOwned>(&self, name: &str, body: &[u8]) -> Result<T, ApiError> {
        let value = self.validate(name, body)?;
        from_value(value)
    }
}

pub(crate) fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::InvalidBody(e.to_string()))
}

fn non_empty_string() -> Value {
    json!({"type": "string", "minLength": 1})
}

fn definitions() -> Vec<(&'static str, Value)> {
    let permissions = json!({
        "type": "object",
        "additionalProperties": {"type": "array", "items": {"type": "string"}}
    });
    vec![
        (
            "update",
            json!({
                "type": "object",
                "required": ["version", "data"],
                "properties": {
                    "version": {"type": "integer", "minimum": 1},
                    "data": {"type": "object"}
                }
            }),
        ),
        (
            "server_discovery",
            json!({
                "type": "object",
                "required": ["id", "host", "username"],
                "additionalProperties": false,
                "properties": {
                    "id": non_empty_string(),
                    "host": non_empty_string(),
                    "username": non_empty_string()
                }
            }),
        ),
        (
            "cluster_create",
            json!({
                "type": "object",
                "required": ["name"],
                "additionalProperties": false,
                "properties": {"name": non_empty_string()}
            }),
        ),
        (
            "playbook_configuration_create",
            json!({
                "type": "object",
                "required": ["name", "playbook_id", "cluster_id"],
                "additionalProperties": false,
                "properties": {
                    "name": non_empty_string(),
                    "playbook_id": non_empty_string(),
                    "cluster_id": non_empty_string(),
                    "server_ids": {
                        "type": "array",
                        "items": {"type": "string"},
                        "uniqueItems": true
                    },
                    "hints": {
                        "oneOf": [
                            {"type": "object"},
                            {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["id", "value"],
                                    "properties": {"id": {"type": "string"}}
                                }
                            }
                        ]
                    },
                    "run": {"type": "boolean"}
                }
            }),
        ),
        (
            "execution_create",
            json!({
                "type": "object",
                "required": ["playbook_configuration"],
                "properties": {
                    "playbook_configuration": {
                        "type": "object",
                        "required": ["id"],
                        "properties": {
                            "id": non_empty_string(),
                            "version": {"type": "integer", "minimum": 1}
                        }
                    }
                }
            }),
        ),
        (
            "execution_step",
            json!({
                "type": "object",
                "required": ["name", "result", "time_started", "time_finished"],
                "properties": {
                    "name": non_empty_string(),
                    "result": {"enum": ["ok", "skipped", "failed", "unreachable"]},
                    "server_id": {"type": ["string", "null"]},
                    "error": {"type": ["string", "null"]},
                    "time_started": {"type": "integer"},
                    "time_finished": {"type": "integer"}
                }
            }),
        ),
        (
            "execution_result",
            json!({
                "type": "object",
                "required": ["state"],
                "properties": {
                    "state": {"enum": ["completed", "failed", "cancelled"]},
                    "reason": {"type": ["string", "null"]}
                }
            }),
        ),
        (
            "role_create",
            json!({
                "type": "object",
                "required": ["name"],
                "additionalProperties": false,
                "properties": {
                    "name": non_empty_string(),
                    "permissions": permissions
                }
            }),
        ),
        (
            "user_create",
            json!({
                "type": "object",
                "required": ["login"],
                "additionalProperties": false,
                "properties": {
                    "login": non_empty_string(),
                    "email": {"type": "string"},
                    "full_name": {"type": "string"},
                    "role_id": {"type": ["string", "null"]}
                }
            }),
        ),
    ]
}
