use anyhow::{bail, Context, Result};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use serde_json_path::JsonPath;

use crate::utils::NonEmptyVec;

/// A presentation definition is a JSON object that describes the information a [Verifier](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:verifier) requires of a [Holder](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:holder).
///
/// Presentation Definitions are composed of inputs, which describe the forms and details of the
/// proofs they require.
///
/// For more information, see: [https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-definition](https://identity.foundation/presentation-exchange/spec/v2.0.0/#presentation-definition)
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresentationDefinition {
    id: String,
    input_descriptors: Vec<InputDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Map<String, Json>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    submission_requirements: Option<Vec<Json>>,
}

impl PresentationDefinition {
    /// The Presentation Definition MUST contain an id property and an input_descriptors property.
    pub fn new(id: impl Into<String>, input_descriptor: InputDescriptor) -> Self {
        Self {
            id: id.into(),
            input_descriptors: vec![input_descriptor],
            ..Default::default()
        }
    }

    /// Return the id of the presentation definition.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a new input descriptor to the presentation definition.
    pub fn add_input_descriptors(mut self, input_descriptor: InputDescriptor) -> Self {
        self.input_descriptors.push(input_descriptor);
        self
    }

    pub fn input_descriptors(&self) -> &[InputDescriptor] {
        &self.input_descriptors
    }

    pub fn set_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn name(&self) -> Option<&String> {
        self.name.as_ref()
    }

    pub fn set_purpose(mut self, purpose: String) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn purpose(&self) -> Option<&String> {
        self.purpose.as_ref()
    }

    pub fn format(&self) -> Option<&Map<String, Json>> {
        self.format.as_ref()
    }

    /// Structural checks beyond deserialization: a non-empty id, at least one input
    /// descriptor, unique descriptor ids, parsable paths and compilable filters.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("presentation definition has an empty id")
        }
        if self.input_descriptors.is_empty() {
            bail!("presentation definition '{}' has no input descriptors", self.id)
        }
        let mut ids = std::collections::HashSet::new();
        for descriptor in &self.input_descriptors {
            if descriptor.id.is_empty() {
                bail!("input descriptor without id in '{}'", self.id)
            }
            if !ids.insert(descriptor.id.as_str()) {
                bail!("duplicate input descriptor id '{}'", descriptor.id)
            }
            for field in descriptor.constraints.fields() {
                for path in field.path().iter() {
                    JsonPath::parse(path).context(format!("invalid path '{path}'"))?;
                }
                if let Some(Err(e)) = field.validator() {
                    bail!("invalid filter in '{}': {e}", descriptor.id)
                }
            }
        }
        Ok(())
    }
}

impl TryFrom<Json> for PresentationDefinition {
    type Error = anyhow::Error;

    fn try_from(value: Json) -> Result<Self> {
        let definition: Self =
            serde_json::from_value(value).context("not a presentation definition")?;
        definition.validate()?;
        Ok(definition)
    }
}

/// The predicate Feature introduces properties enabling Verifier to request that Holder apply a predicate and return the result.
///
/// See: [https://identity.foundation/presentation-exchange/#predicate-feature](https://identity.foundation/presentation-exchange/#predicate-feature)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum Predicate {
    #[serde(rename = "required")]
    Required,
    #[serde(rename = "preferred")]
    Preferred,
}

/// Input Descriptors are objects used to describe the information a
/// [Verifier](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:verifier) requires of a
/// [Holder](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:holder).
///
/// All Input Descriptors MUST be satisfied, unless otherwise specified by a
/// [Feature](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:feature).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    id: String,
    #[serde(default)]
    constraints: Constraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Map<String, Json>>,
    /// Schema references of the first Presentation Exchange draft.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    schema: Vec<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    group: Vec<String>,
}

impl InputDescriptor {
    pub fn new(id: impl Into<String>, constraints: Constraints) -> Self {
        Self {
            id: id.into(),
            constraints,
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn set_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn set_purpose(mut self, purpose: String) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn purpose(&self) -> Option<&String> {
        self.purpose.as_ref()
    }

    /// Whether `credential` satisfies every required field of the constraints.
    ///
    /// Each field is evaluated with its JSONPath expressions in order; the first path that
    /// yields a value passing the filter satisfies the field.
    pub fn validate_credential(&self, credential: &Json) -> Result<()> {
        if let Some(ConstraintsLimitDisclosure::Required) = self.constraints.limit_disclosure {
            if self.constraints.fields().is_empty() {
                bail!("Required limit disclosure must have fields.")
            }
        }

        for field in self.constraints.fields() {
            if let Some(Predicate::Required) = field.predicate() {
                if field.filter().is_none() {
                    bail!("Required predicate must have a filter.")
                }
            }

            let validator = match field.validator() {
                Some(Ok(validator)) => Some(validator),
                Some(Err(e)) => bail!("invalid filter: {e}"),
                None => None,
            };

            let mut found = false;
            for path in field.path().iter() {
                let path = JsonPath::parse(path).context(format!("invalid path '{path}'"))?;
                let nodes = path.query(credential).all();
                // > If the result returned no JSONPath match, skip to the next path array element.
                if nodes.is_empty() {
                    continue;
                }
                found = match &validator {
                    Some(validator) => nodes.iter().any(|node| validator.is_valid(node)),
                    None => true,
                };
                if found {
                    break;
                }
            }

            if !found && field.is_required() {
                bail!(
                    "input descriptor '{}' requires a value at {:?}",
                    self.id,
                    field.path().as_ref()
                )
            }
        }

        Ok(())
    }
}

/// Constraints are objects used to describe the constraints that a [Holder](https://identity.foundation/presentation-exchange/spec/v2.0.0/#term:holder) must satisfy to fulfill an Input Descriptor.
///
/// A constraint object MAY be empty, or it may include a `fields` and/or `limit_disclosure` property.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<ConstraintsField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_disclosure: Option<ConstraintsLimitDisclosure>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(mut self, field: ConstraintsField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[ConstraintsField] {
        &self.fields
    }

    pub fn set_limit_disclosure(mut self, limit_disclosure: ConstraintsLimitDisclosure) -> Self {
        self.limit_disclosure = Some(limit_disclosure);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintsField {
    path: NonEmptyVec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    predicate: Option<Predicate>,
}

impl ConstraintsField {
    /// Constraint fields must have at least one JSONPath to the field for which the constraint is applied.
    pub fn new(path: impl Into<String>) -> ConstraintsField {
        ConstraintsField {
            path: NonEmptyVec::new(path.into()),
            ..Default::default()
        }
    }

    pub fn add_path(mut self, path: impl Into<String>) -> Self {
        self.path.push(path.into());
        self
    }

    pub fn path(&self) -> &NonEmptyVec<String> {
        &self.path
    }

    pub fn set_purpose(mut self, purpose: String) -> Self {
        self.purpose = Some(purpose);
        self
    }

    /// If present its value MUST be a JSON Schema descriptor used to filter against
    /// the values returned from evaluation of the JSONPath string expressions in the path array.
    pub fn set_filter(mut self, filter: Json) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter(&self) -> Option<&Json> {
        self.filter.as_ref()
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Return a JSON schema validator using the internal filter.
    pub fn validator(&self) -> Option<Result<JSONSchema, ValidationError>> {
        self.filter.as_ref().map(JSONSchema::compile)
    }

    pub fn set_optional(mut self, optional: bool) -> Self {
        self.optional = Some(optional);
        self
    }

    pub fn is_required(&self) -> bool {
        !self.optional.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintsLimitDisclosure {
    Required,
    Preferred,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn definition() -> Json {
        json!({
            "id": "Insurance Plans",
            "input_descriptors": [{
                "id": "Ontario Health Insurance Plan",
                "constraints": {
                    "fields": [{
                        "path": ["$.credentialSubject.type", "$.vc.credentialSubject.type"],
                        "filter": { "type": "string", "const": "OHIP" }
                    }]
                }
            }]
        })
    }

    #[test]
    fn parse_and_validate() {
        let definition = PresentationDefinition::try_from(definition()).unwrap();
        assert_eq!(definition.id(), "Insurance Plans");
        assert_eq!(definition.input_descriptors().len(), 1);
    }

    #[test]
    fn definition_without_id() {
        let mut value = definition();
        value.as_object_mut().unwrap().remove("id");
        assert!(PresentationDefinition::try_from(value).is_err());
    }

    #[test]
    fn definition_without_descriptors() {
        assert!(PresentationDefinition::try_from(json!({
            "id": "empty",
            "input_descriptors": []
        }))
        .is_err());
    }

    #[test]
    fn credential_constraints() {
        let definition = PresentationDefinition::try_from(definition()).unwrap();
        let descriptor = &definition.input_descriptors()[0];

        descriptor
            .validate_credential(&json!({ "credentialSubject": { "type": "OHIP" } }))
            .unwrap();
        descriptor
            .validate_credential(&json!({ "vc": { "credentialSubject": { "type": "OHIP" } } }))
            .unwrap();
        assert!(descriptor
            .validate_credential(&json!({ "credentialSubject": { "type": "NHS" } }))
            .is_err());
        assert!(descriptor.validate_credential(&json!({})).is_err());
    }
}
