//! Discovery of presentation definitions in requests, credential selection and validation of
//! submitted presentations.

pub mod evaluation;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use serde_json_path::JsonPath;
use tracing::debug;
use url::Url;

use self::evaluation::{EvaluationEngine, JsonPathEvaluator, SelectResults, Status};
use crate::core::jwt;
use crate::core::object::UntypedObject;
use crate::core::presentation_definition::PresentationDefinition;
use crate::core::presentation_submission::{
    assert_valid_presentation_submission, PresentationSubmission,
};
use crate::core::util::{get_json, AsyncHttpClient};
use crate::core::version::SupportedVersion;
use crate::error::{Error, ErrorKind, Result};

/// Where in a request a presentation definition was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationDefinitionLocation {
    /// `claims.vp_token.presentation_definition(_uri)`.
    ClaimsVpToken,
    /// `presentation_definition(_uri)` at the top level of the request.
    TopLevelPresentationDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationDefinitionWithLocation {
    pub definition: PresentationDefinition,
    pub location: PresentationDefinitionLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<SupportedVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiablePresentationTypeFormat {
    JwtVp,
    LdpVp,
}

/// A presentation as received in a `vp_token`, together with its decoded form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiablePresentationPayload {
    pub format: VerifiablePresentationTypeFormat,
    /// The presentation object (the `vp` claim of a JWT presentation).
    pub presentation: Json,
    /// The presentation as transmitted: a compact JWT or a JSON-LD object.
    pub original: Json,
}

impl TryFrom<Json> for VerifiablePresentationPayload {
    type Error = anyhow::Error;

    fn try_from(original: Json) -> AnyResult<Self> {
        match &original {
            Json::String(token) => {
                let decoded = jwt::decode(token).context("presentation is not a JWT")?;
                let presentation = decoded
                    .payload
                    .get_raw("vp")
                    .cloned()
                    .context("JWT presentation has no 'vp' claim")?;
                Ok(Self {
                    format: VerifiablePresentationTypeFormat::JwtVp,
                    presentation,
                    original,
                })
            }
            Json::Object(_) => Ok(Self {
                format: VerifiablePresentationTypeFormat::LdpVp,
                presentation: original.clone(),
                original,
            }),
            _ => anyhow::bail!("a presentation is a JWT or a JSON object"),
        }
    }
}

impl VerifiablePresentationPayload {
    /// Parse a `vp_token` value, a single presentation or a list of them.
    pub fn from_vp_token(vp_token: &Json) -> Result<Vec<Self>> {
        match vp_token {
            Json::Array(items) => items
                .iter()
                .cloned()
                .map(Self::try_from)
                .collect::<AnyResult<Vec<_>>>()
                .validation(),
            single => Self::try_from(single.clone()).map(|p| vec![p]).validation(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationVerificationResult {
    pub verified: bool,
}

/// Verifies the proof of a received presentation.
#[async_trait]
pub trait PresentationVerificationCallback: Send + Sync {
    async fn verify(
        &self,
        presentation: &VerifiablePresentationPayload,
    ) -> AnyResult<PresentationVerificationResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationSignOptions {
    pub proof_purpose: String,
    pub proof_type: String,
    pub challenge: Option<String>,
    pub domain: Option<String>,
    pub verification_method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationSignParams {
    /// The unsigned presentation, with its `presentation_submission`.
    pub presentation: Json,
    pub options: PresentationSignOptions,
    pub presentation_definition: PresentationDefinition,
    pub selected_credentials: Vec<Json>,
}

/// Signs presentations on behalf of the holder.
#[async_trait]
pub trait PresentationSignCallback: Send + Sync {
    /// Returns the signed presentation, a compact JWT or a JSON-LD object.
    async fn sign(&self, params: PresentationSignParams) -> AnyResult<Json>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionOpts {
    pub nonce: Option<String>,
    pub domain: Option<String>,
}

/// A presentation accepted for a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPresentation {
    pub definition_id: String,
    pub presentation: VerifiablePresentationPayload,
    pub submission: PresentationSubmission,
}

/// Holder side presentation exchange over a pool of credentials.
#[derive(Clone)]
pub struct PresentationExchange {
    holder_did: String,
    credentials: Vec<Json>,
    engine: Arc<dyn EvaluationEngine>,
}

impl fmt::Debug for PresentationExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationExchange")
            .field("holder_did", &self.holder_did)
            .field("credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}

impl PresentationExchange {
    pub fn new(holder_did: impl Into<String>, credentials: Vec<Json>) -> Self {
        Self {
            holder_did: holder_did.into(),
            credentials,
            engine: Arc::new(JsonPathEvaluator),
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn EvaluationEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Select the credentials of the holder that satisfy `definition`.
    pub fn select_verifiable_credentials_for_submission(
        &self,
        definition: &PresentationDefinition,
    ) -> Result<SelectResults> {
        if self.credentials.is_empty() {
            return Err(Error::PresentationMatchFailure(
                "no verifiable credentials to select from".into(),
            ));
        }

        let results =
            self.engine
                .select_from(definition, &self.credentials, &[self.holder_did.clone()]);

        if results.are_required_credentials_present == Status::Error {
            let details: Vec<String> = results.errors.iter().map(|e| e.message.clone()).collect();
            return Err(Error::PresentationMatchFailure(format!(
                "could not find credentials matching '{}': {}",
                definition.id(),
                details.join(", ")
            )));
        }
        Ok(results)
    }

    /// Build and sign a presentation of `selected` for `definition`.
    pub async fn submission_from(
        &self,
        definition: &PresentationDefinition,
        selected: &[Json],
        opts: SubmissionOpts,
        callback: &dyn PresentationSignCallback,
    ) -> Result<VerifiablePresentationPayload> {
        let options = PresentationSignOptions {
            proof_purpose: "authentication".into(),
            proof_type: "EcdsaSecp256k1Signature2019".into(),
            challenge: opts.nonce,
            domain: opts.domain,
            verification_method: format!("{}#key", self.holder_did),
        };

        let presentation = self
            .engine
            .verifiable_presentation_from(definition, selected, &self.holder_did, options, callback)
            .await
            .match_failure()?;

        VerifiablePresentationPayload::try_from(presentation).validation()
    }

    /// Find the presentation definitions a request carries, by value or by reference.
    ///
    /// Definitions inside `claims.vp_token` are only looked at for dialects that predate
    /// [SupportedVersion::SiopV2D11], or when the dialect is unknown.
    pub async fn find_valid_presentation_definitions(
        payload: &UntypedObject,
        version: Option<SupportedVersion>,
        http_client: &dyn AsyncHttpClient,
    ) -> Result<Vec<PresentationDefinitionWithLocation>> {
        let json = Json::from(payload.clone());
        let mut definitions = vec![];

        if version.map_or(true, |v| v < SupportedVersion::SiopV2D11) {
            definitions.extend(
                extract_definitions(
                    &json,
                    "$..vp_token.presentation_definition",
                    "$..vp_token.presentation_definition_uri",
                    PresentationDefinitionLocation::ClaimsVpToken,
                    version,
                    http_client,
                )
                .await?,
            );
        }

        definitions.extend(
            extract_definitions(
                &json,
                "$.presentation_definition",
                "$.presentation_definition_uri",
                PresentationDefinitionLocation::TopLevelPresentationDef,
                version,
                http_client,
            )
            .await?,
        );

        debug!("found {} presentation definitions", definitions.len());
        Ok(definitions)
    }

    /// Check that each definition is answered by exactly one of the presentations.
    ///
    /// Definitions are validated concurrently and the call fails if any of them fails. The
    /// verification callback runs once per presentation, before matching, and a failed
    /// verification rejects the call even if the presentation would not have been selected.
    pub async fn validate_payloads_against_definitions(
        definitions: &[PresentationDefinitionWithLocation],
        vp_payloads: &[VerifiablePresentationPayload],
        submission: Option<&PresentationSubmission>,
        verification: Option<&Arc<dyn PresentationVerificationCallback>>,
        engine: &dyn EvaluationEngine,
    ) -> Result<Vec<ValidatedPresentation>> {
        if definitions.is_empty() || vp_payloads.is_empty() {
            return Err(Error::PresentationMatchFailure(
                "no presentation definitions or no presentations".into(),
            ));
        }
        if definitions.len() != vp_payloads.len() {
            return Err(Error::PresentationMatchFailure(format!(
                "{} presentation definitions but {} presentations",
                definitions.len(),
                vp_payloads.len()
            )));
        }

        if let Some(verification) = verification {
            try_join_all(vp_payloads.iter().map(|payload| verify_presentation(verification, payload)))
                .await?;
        }

        try_join_all(definitions.iter().map(|definition| {
            validate_against_definition(&definition.definition, vp_payloads, submission, engine)
        }))
        .await
    }
}

async fn verify_presentation(
    verification: &Arc<dyn PresentationVerificationCallback>,
    payload: &VerifiablePresentationPayload,
) -> Result<()> {
    let result = verification
        .verify(payload)
        .await
        .context("presentation verification failed")
        .signature()?;
    if !result.verified {
        return Err(Error::SignatureVerificationFailure(
            "verifiable presentation signature is not valid".into(),
        ));
    }
    Ok(())
}

async fn validate_against_definition(
    definition: &PresentationDefinition,
    vp_payloads: &[VerifiablePresentationPayload],
    submission: Option<&PresentationSubmission>,
    engine: &dyn EvaluationEngine,
) -> Result<ValidatedPresentation> {
    // A presentation without a submission for this definition is not a candidate for it.
    let candidates: Vec<&VerifiablePresentationPayload> = vp_payloads
        .iter()
        .filter(|payload| {
            engine
                .evaluate_presentation(definition, &payload.presentation, submission)
                .value
                .is_some_and(|value| value.definition_id() == definition.id())
        })
        .collect();

    let [payload] = candidates.as_slice() else {
        return Err(Error::PresentationMatchFailure(format!(
            "expected one presentation for '{}', found {}",
            definition.id(),
            candidates.len()
        )));
    };

    let results = engine.evaluate_presentation(definition, &payload.presentation, submission);
    let value = results.value.ok_or_else(|| {
        Error::PresentationMatchFailure("the presentation has no submission".into())
    })?;
    assert_valid_presentation_submission(&Json::from(value.clone()))?;
    if !results.errors.is_empty() {
        let details: Vec<String> = results.errors.into_iter().map(|e| e.message).collect();
        return Err(Error::PresentationMatchFailure(format!(
            "presentation does not satisfy '{}': {}",
            definition.id(),
            details.join(", ")
        )));
    }

    Ok(ValidatedPresentation {
        definition_id: definition.id().to_string(),
        presentation: (*payload).clone(),
        submission: value,
    })
}

fn query(json: &Json, path: &str) -> Result<Vec<Json>> {
    let path = JsonPath::parse(path)
        .map_err(|e| Error::ValidationFailure(format!("invalid path '{path}': {e}")))?;
    Ok(path.query(json).all().into_iter().cloned().collect())
}

fn flatten(values: Vec<Json>) -> Vec<Json> {
    values
        .into_iter()
        .flat_map(|v| match v {
            Json::Array(items) => items,
            other => vec![other],
        })
        .collect()
}

async fn extract_definitions(
    json: &Json,
    value_path: &str,
    reference_path: &str,
    location: PresentationDefinitionLocation,
    version: Option<SupportedVersion>,
    http_client: &dyn AsyncHttpClient,
) -> Result<Vec<PresentationDefinitionWithLocation>> {
    let values = flatten(query(json, value_path)?);
    let references = flatten(query(json, reference_path)?);

    if !values.is_empty() && !references.is_empty() {
        return Err(Error::PresentationDefinitionConflict(format!(
            "{location:?} carries presentation definitions by value and by reference"
        )));
    }

    let mut raw = values;
    for reference in references {
        let url = reference
            .as_str()
            .and_then(|r| Url::parse(r).ok())
            .ok_or_else(|| {
                Error::ValidationFailure(format!("invalid presentation definition uri {reference}"))
            })?;
        debug!("fetching presentation definition from {url}");
        raw.push(get_json(http_client, &url).await?);
    }

    raw.into_iter()
        .map(|value| {
            PresentationDefinition::try_from(value)
                .validation()
                .map(|definition| PresentationDefinitionWithLocation {
                    definition,
                    location,
                    version,
                })
        })
        .collect()
}
