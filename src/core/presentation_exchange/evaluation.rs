//! Matching credentials and presentations against presentation definitions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use serde_json_path::JsonPath;
use tracing::debug;

use super::{PresentationSignCallback, PresentationSignOptions, PresentationSignParams};
use crate::core::jwt;
use crate::core::presentation_definition::{InputDescriptor, PresentationDefinition};
use crate::core::presentation_submission::{DescriptorMap, PresentationSubmission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

/// One finding of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checked {
    pub tag: String,
    pub status: Status,
    pub message: String,
}

impl Checked {
    fn error(tag: &str, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            status: Status::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequirementMatch {
    /// The input descriptor id.
    pub name: String,
    pub vc_path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectResults {
    pub are_required_credentials_present: Status,
    pub verifiable_credential: Vec<Json>,
    pub matches: Vec<SubmissionRequirementMatch>,
    pub errors: Vec<Checked>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub value: Option<PresentationSubmission>,
    pub errors: Vec<Checked>,
}

/// Selection, evaluation and construction of presentations.
#[async_trait]
pub trait EvaluationEngine: Send + Sync {
    /// Select the credentials satisfying `definition`, restricted to credentials of `holder_dids`.
    fn select_from(
        &self,
        definition: &PresentationDefinition,
        credentials: &[Json],
        holder_dids: &[String],
    ) -> SelectResults;

    /// Evaluate a (decoded) presentation against `definition`.
    ///
    /// A supplied `submission` takes precedence over one embedded in the presentation; without
    /// either, one is derived from the embedded credentials.
    fn evaluate_presentation(
        &self,
        definition: &PresentationDefinition,
        presentation: &Json,
        submission: Option<&PresentationSubmission>,
    ) -> EvaluationResults;

    /// Build a presentation of `credentials` for `definition` and have it signed.
    async fn verifiable_presentation_from(
        &self,
        definition: &PresentationDefinition,
        credentials: &[Json],
        holder_did: &str,
        options: PresentationSignOptions,
        callback: &dyn PresentationSignCallback,
    ) -> Result<Json>;
}

/// Evaluates input descriptor constraints with JSONPath field selection and JSON schema filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathEvaluator;

/// The JSON a credential is evaluated as; JWT credentials are decoded to their claims.
fn credential_view(credential: &Json) -> Json {
    match credential {
        Json::String(token) => jwt::decode(token)
            .map(|decoded| decoded.payload.into())
            .unwrap_or(Json::Null),
        other => other.clone(),
    }
}

fn credential_subject_id(view: &Json) -> Option<&str> {
    view.pointer("/credentialSubject/id")
        .or_else(|| view.pointer("/vc/credentialSubject/id"))
        .or_else(|| view.get("sub"))
        .and_then(Json::as_str)
}

fn credential_format(credential: &Json) -> &'static str {
    match credential {
        Json::String(_) => "jwt_vc",
        _ => "ldp_vc",
    }
}

fn presentation_credentials(presentation: &Json) -> Vec<Json> {
    match presentation.get("verifiableCredential") {
        Some(Json::Array(credentials)) => credentials.clone(),
        Some(credential) => vec![credential.clone()],
        None => vec![],
    }
}

fn matching_credentials(descriptor: &InputDescriptor, credentials: &[Json]) -> Vec<usize> {
    credentials
        .iter()
        .enumerate()
        .filter(|(_, c)| descriptor.validate_credential(&credential_view(c)).is_ok())
        .map(|(i, _)| i)
        .collect()
}

/// Resolve a descriptor map path, accepting paths relative to the presentation or to a
/// `vp` claim wrapping it.
fn resolve_path(presentation: &Json, map: &DescriptorMap) -> Result<Json> {
    let path = JsonPath::parse(&map.path).context(format!("invalid path '{}'", map.path))?;
    let wrapped = json!({ "vp": presentation });
    let value = path
        .query(presentation)
        .all()
        .into_iter()
        .next()
        .or_else(|| path.query(&wrapped).all().into_iter().next())
        .cloned()
        .context(format!("nothing found at '{}'", map.path))?;

    match &map.path_nested {
        Some(nested) => resolve_path(&credential_view(&value), nested),
        None => Ok(value),
    }
}

/// Derive a submission from the credentials embedded in a presentation.
fn derive_submission(
    definition: &PresentationDefinition,
    credentials: &[Json],
) -> std::result::Result<PresentationSubmission, Vec<Checked>> {
    let mut descriptor_map = vec![];
    let mut errors = vec![];
    for descriptor in definition.input_descriptors() {
        match matching_credentials(descriptor, credentials).first() {
            Some(&i) => descriptor_map.push(DescriptorMap::new(
                descriptor.id(),
                credential_format(&credentials[i]),
                format!("$.verifiableCredential[{i}]"),
            )),
            None => errors.push(Checked::error(
                "FilterEvaluation",
                format!("no credential satisfies input descriptor '{}'", descriptor.id()),
            )),
        }
    }
    if errors.is_empty() {
        Ok(PresentationSubmission::new(definition.id(), descriptor_map))
    } else {
        Err(errors)
    }
}

#[async_trait]
impl EvaluationEngine for JsonPathEvaluator {
    fn select_from(
        &self,
        definition: &PresentationDefinition,
        credentials: &[Json],
        holder_dids: &[String],
    ) -> SelectResults {
        let owned: Vec<Json> = credentials
            .iter()
            .filter(|c| {
                let view = credential_view(c);
                match credential_subject_id(&view) {
                    Some(subject) if !holder_dids.is_empty() => {
                        holder_dids.iter().any(|did| did == subject)
                    }
                    _ => true,
                }
            })
            .cloned()
            .collect();

        let mut selected: Vec<usize> = vec![];
        let mut matches = vec![];
        let mut errors = vec![];
        for descriptor in definition.input_descriptors() {
            let found = matching_credentials(descriptor, &owned);
            if found.is_empty() {
                errors.push(Checked::error(
                    "FilterEvaluation",
                    format!(
                        "input descriptor '{}' is not satisfied by any credential",
                        descriptor.id()
                    ),
                ));
            }
            let mut vc_path = vec![];
            for i in found {
                let position = match selected.iter().position(|&s| s == i) {
                    Some(p) => p,
                    None => {
                        selected.push(i);
                        selected.len() - 1
                    }
                };
                vc_path.push(format!("$.verifiableCredential[{position}]"));
            }
            matches.push(SubmissionRequirementMatch {
                name: descriptor.id().to_string(),
                vc_path,
            });
        }

        debug!(
            "selected {} of {} credentials for '{}'",
            selected.len(),
            credentials.len(),
            definition.id()
        );

        SelectResults {
            are_required_credentials_present: if errors.is_empty() {
                Status::Info
            } else {
                Status::Error
            },
            verifiable_credential: selected.into_iter().map(|i| owned[i].clone()).collect(),
            matches,
            errors,
        }
    }

    fn evaluate_presentation(
        &self,
        definition: &PresentationDefinition,
        presentation: &Json,
        submission: Option<&PresentationSubmission>,
    ) -> EvaluationResults {
        let embedded = presentation
            .get("presentation_submission")
            .cloned()
            .and_then(|s| PresentationSubmission::try_from(s).ok());

        let submission = match submission.cloned().or(embedded) {
            Some(submission) => submission,
            None => {
                return match derive_submission(definition, &presentation_credentials(presentation))
                {
                    Ok(submission) => EvaluationResults {
                        value: Some(submission),
                        errors: vec![],
                    },
                    Err(errors) => EvaluationResults {
                        value: None,
                        errors,
                    },
                }
            }
        };

        let mut errors = vec![];
        if submission.definition_id() != definition.id() {
            errors.push(Checked::error(
                "SubmissionDefinitionId",
                format!(
                    "submission answers '{}', not '{}'",
                    submission.definition_id(),
                    definition.id()
                ),
            ));
        }

        for map in submission.descriptor_map() {
            if !definition.input_descriptors().iter().any(|d| d.id() == map.id) {
                errors.push(Checked::error(
                    "UriEvaluation",
                    format!("'{}' is not an input descriptor of the definition", map.id),
                ));
            }
        }

        for descriptor in definition.input_descriptors() {
            let entries: Vec<&DescriptorMap> = submission
                .descriptor_map()
                .iter()
                .filter(|m| m.id == descriptor.id())
                .collect();
            if entries.is_empty() {
                errors.push(Checked::error(
                    "MarkForSubmissionEvaluation",
                    format!("input descriptor '{}' is not answered", descriptor.id()),
                ));
                continue;
            }
            for entry in entries {
                let outcome = resolve_path(presentation, entry)
                    .and_then(|credential| descriptor.validate_credential(&credential_view(&credential)));
                if let Err(e) = outcome {
                    errors.push(Checked::error("FilterEvaluation", format!("{e:#}")));
                }
            }
        }

        EvaluationResults {
            value: Some(submission),
            errors,
        }
    }

    async fn verifiable_presentation_from(
        &self,
        definition: &PresentationDefinition,
        credentials: &[Json],
        holder_did: &str,
        options: PresentationSignOptions,
        callback: &dyn PresentationSignCallback,
    ) -> Result<Json> {
        let submission = derive_submission(definition, credentials).map_err(|errors| {
            anyhow::anyhow!(
                "{}",
                errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?;

        let presentation = json!({
            "@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": ["VerifiablePresentation"],
            "holder": holder_did,
            "verifiableCredential": credentials,
            "presentation_submission": Json::from(submission),
        });

        callback
            .sign(PresentationSignParams {
                presentation,
                options,
                presentation_definition: definition.clone(),
                selected_credentials: credentials.to_vec(),
            })
            .await
            .context("failed to sign the presentation")
    }
}
