use std::sync::OnceLock;

use anyhow::Context;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use super::object::TypedParameter;
use crate::error::{Error, Result};

/// Presentation Submissions are objects embedded within target
/// [Claim](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:claim) negotiation
/// formats that express how the inputs presented as proofs to a
/// [Verifier](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:verifier) are
/// provided in accordance with the requirements specified in a presentation definition.
///
/// For more information, see: [https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-submission](https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-submission)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationSubmission {
    id: String,
    definition_id: String,
    descriptor_map: Vec<DescriptorMap>,
}

impl TypedParameter for PresentationSubmission {
    const KEY: &'static str = "presentation_submission";
}

impl PresentationSubmission {
    /// The `definition_id` MUST be the id of a valid presentation definition.
    pub fn new(definition_id: impl Into<String>, descriptor_map: Vec<DescriptorMap>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition_id.into(),
            descriptor_map,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn descriptor_map(&self) -> &[DescriptorMap] {
        &self.descriptor_map
    }
}

impl TryFrom<Json> for PresentationSubmission {
    type Error = anyhow::Error;

    fn try_from(raw: Json) -> Result<Self, Self::Error> {
        serde_json::from_value(raw).context("not a presentation submission")
    }
}

impl From<PresentationSubmission> for Json {
    fn from(value: PresentationSubmission) -> Self {
        json!({
            "id": value.id,
            "definition_id": value.definition_id,
            "descriptor_map": value.descriptor_map,
        })
    }
}

/// Descriptor Maps are objects used to describe the information a [Holder](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:holder) provides to a [Verifier](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:verifier).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptorMap {
    pub id: String,
    pub format: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_nested: Option<Box<DescriptorMap>>,
}

impl DescriptorMap {
    pub fn new(id: impl Into<String>, format: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            format: format.into(),
            path: path.into(),
            path_nested: None,
        }
    }

    pub fn set_path_nested(mut self, nested: DescriptorMap) -> Self {
        self.path_nested = Some(Box::new(nested));
        self
    }
}

fn submission_schema() -> Json {
    json!({
        "definitions": {
            "descriptor": {
                "type": "object",
                "required": ["id", "format", "path"],
                "properties": {
                    "id": { "type": "string" },
                    "format": { "type": "string" },
                    "path": { "type": "string" },
                    "path_nested": { "$ref": "#/definitions/descriptor" }
                }
            }
        },
        "type": "object",
        "required": ["id", "definition_id", "descriptor_map"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "definition_id": { "type": "string", "minLength": 1 },
            "descriptor_map": {
                "type": "array",
                "items": { "$ref": "#/definitions/descriptor" }
            }
        }
    })
}

/// Schema-validate a submission.
pub fn assert_valid_presentation_submission(submission: &Json) -> Result<()> {
    static SCHEMA: OnceLock<JSONSchema> = OnceLock::new();
    let compiled = match SCHEMA.get() {
        Some(schema) => schema,
        None => {
            let schema = JSONSchema::compile(&submission_schema()).map_err(|e| {
                Error::ValidationFailure(format!("invalid submission schema: {e}"))
            })?;
            SCHEMA.get_or_init(|| schema)
        }
    };
    if let Err(errors) = compiled.validate(submission) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(Error::ValidationFailure(format!(
            "presentation submission is not valid: {}",
            details.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema() {
        let submission = PresentationSubmission::new(
            "pd",
            vec![DescriptorMap::new("d1", "jwt_vc", "$.verifiableCredential[0]")],
        );
        assert_valid_presentation_submission(&submission.clone().into()).unwrap();

        let parsed = PresentationSubmission::try_from(Json::from(submission.clone())).unwrap();
        assert_eq!(parsed, submission);

        assert!(assert_valid_presentation_submission(&json!({
            "id": "x",
            "definition_id": "pd",
            "descriptor_map": [{ "id": "d1" }]
        }))
        .is_err());
    }
}
