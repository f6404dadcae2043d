use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::core::jwt::SigningAlgo;
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectType {
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "pairwise")]
    Pairwise,
}

/// Metadata a relying party publishes about itself, by value (`registration`,
/// `client_metadata`) or by reference (`registration_uri`, `client_metadata_uri`).
///
/// Localized entries such as `client_name#nl-NL` are kept in `other`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpRegistrationMetadataPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_signing_alg_values_supported: Vec<SigningAlgo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_object_signing_alg_values_supported: Vec<SigningAlgo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_types_supported: Vec<SubjectType>,
    #[serde(default)]
    pub subject_syntax_types_supported: Vec<String>,
    /// Claim format designations mapped to their algorithms or proof types.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vp_formats: Map<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_purpose: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Json>,
}

impl RpRegistrationMetadataPayload {
    /// Returns the metadata with a localized entry such as `client_name#nl-NL`.
    pub fn with_localized(mut self, key: &str, locale: &str, value: impl Into<String>) -> Self {
        self.other
            .insert(format!("{key}#{locale}"), Json::String(value.into()));
        self
    }

    /// Returns the metadata with `subject_syntax_types_supported` extended by `types`,
    /// without duplicates.
    pub fn with_subject_syntax_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        for t in types {
            if !self.subject_syntax_types_supported.contains(&t) {
                self.subject_syntax_types_supported.push(t);
            }
        }
        self
    }
}

fn registration_schema() -> Json {
    let algs = json!(["EdDSA", "RS256", "PS256", "ES256", "ES256K"]);
    json!({
        "type": "object",
        "required": ["subject_syntax_types_supported"],
        "properties": {
            "client_id": { "type": "string" },
            "id_token_signing_alg_values_supported": { "type": "array", "items": { "enum": algs } },
            "request_object_signing_alg_values_supported": { "type": "array", "items": { "enum": algs } },
            "response_types_supported": { "type": "array", "items": { "type": "string" } },
            "scopes_supported": { "type": "array", "items": { "type": "string" } },
            "subject_types_supported": { "type": "array", "items": { "enum": ["public", "pairwise"] } },
            "subject_syntax_types_supported": {
                "type": "array",
                "minItems": 1,
                "items": { "type": "string" }
            },
            "vp_formats": { "type": "object" },
            "client_name": { "type": "string" },
            "logo_uri": { "type": "string" },
            "client_purpose": { "type": "string" }
        }
    })
}

fn compiled_registration_schema() -> Result<&'static JSONSchema> {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    if let Some(schema) = SCHEMA.get() {
        return Ok(schema);
    }
    let compiled = JSONSchema::compile(&registration_schema())
        .map_err(|e| Error::ValidationFailure(format!("invalid registration schema: {e}")))?;
    Ok(SCHEMA.get_or_init(|| compiled))
}

/// Check that resolved registration metadata is well formed.
pub fn assert_valid_rp_registration_metadata(
    metadata: Option<&Json>,
) -> Result<RpRegistrationMetadataPayload> {
    let metadata = metadata.ok_or_else(|| {
        Error::ValidationFailure("the request carries no registration metadata".into())
    })?;

    let compiled = compiled_registration_schema()?;
    if let Err(errors) = compiled.validate(metadata) {
        let details: Vec<String> = errors
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect();
        return Err(Error::ValidationFailure(format!(
            "registration metadata is not valid: {}",
            details.join(", ")
        )));
    }

    serde_json::from_value(metadata.clone()).validation()
}
