//! The self-issued id token response, and presentations sent along with it.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value as Json};
use tracing::debug;
use url::Url;

use self::parameters::{Audience, IdToken, Nonce, State, Subject, VpToken, SELF_ISSUED_ISSUER};

use super::authorization_request::VerifiedAuthorizationRequest;
use super::did::{verify_did_jwt, DidResolver, VerifiedJwt};
use super::linked_domain::{
    validate_linked_domain_with_did, CheckLinkedDomain, DomainLinkageVerifier,
};
use super::object::{ParsingErrorContext, TypedParameter, UntypedObject};
use super::presentation_exchange::evaluation::{EvaluationEngine, JsonPathEvaluator};
use super::presentation_exchange::{
    PresentationDefinitionWithLocation, PresentationExchange, PresentationVerificationCallback,
    ValidatedPresentation, VerifiablePresentationPayload,
};
use super::presentation_submission::PresentationSubmission;
use super::signer::SignatureType;
use super::util::{post_form, AsyncHttpClient};
use super::version::SupportedVersion;
use crate::error::{Error, ErrorKind, Result};
use crate::utils::now;

pub mod parameters;

pub const DEFAULT_ID_TOKEN_EXPIRES_IN: u64 = 600;

/// Response parameters, posted form encoded to the RP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationResponsePayload(pub UntypedObject);

impl AuthorizationResponsePayload {
    pub fn id_token(&self) -> anyhow::Result<IdToken> {
        self.0.get().parsing_error()
    }

    pub fn vp_token(&self) -> Option<anyhow::Result<VpToken>> {
        self.0.get()
    }

    pub fn presentation_submission(&self) -> Option<anyhow::Result<PresentationSubmission>> {
        self.0.get()
    }

    pub fn state(&self) -> Option<String> {
        self.0.get::<State>()?.ok().map(|s| s.0)
    }

    /// Form fields; objects and lists are JSON serialized.
    pub fn to_form(&self) -> Result<Vec<(String, String)>> {
        self.0
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let value = match v {
                    Json::String(s) => s.clone(),
                    other => serde_json::to_string(other).validation()?,
                };
                Ok((k.clone(), value))
            })
            .collect()
    }

    pub fn from_form(body: &str) -> Result<Self> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(body).validation()?;
        let mut object = UntypedObject::new();
        for (key, value) in pairs {
            let value = if parameters::JSON_PARAMETERS.contains(&key.as_str()) {
                serde_json::from_str(&value).unwrap_or(Json::String(value))
            } else {
                Json::String(value)
            };
            object.insert_raw(key, value);
        }
        Ok(Self(object))
    }
}

/// Presentations to send along with the id token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentationExchangeResponseOpts {
    pub vps: Vec<VerifiablePresentationPayload>,
    /// Describes all of `vps`; taken from the presentation when there is only one.
    pub presentation_submission: Option<PresentationSubmission>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationResponseOpts {
    pub signature: SignatureType,
    /// OP metadata, added to the id token as `registration`.
    pub registration: Option<Json>,
    /// Lifetime of the id token in seconds.
    pub expires_in: u64,
    /// Overrides the request's nonce and state when set.
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub presentation_exchange: Option<PresentationExchangeResponseOpts>,
}

impl AuthorizationResponseOpts {
    pub fn new(signature: SignatureType) -> Self {
        Self {
            signature,
            registration: None,
            expires_in: DEFAULT_ID_TOKEN_EXPIRES_IN,
            nonce: None,
            state: None,
            presentation_exchange: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_registration(mut self, registration: Json) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn with_expires_in(mut self, expires_in: u64) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub fn with_presentation_exchange(mut self, pe: PresentationExchangeResponseOpts) -> Self {
        self.presentation_exchange = Some(pe);
        self
    }
}

/// An authorization response ready to be posted back.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationResponse {
    payload: AuthorizationResponsePayload,
    id_token_payload: UntypedObject,
    redirect_uri: Option<Url>,
}

impl AuthorizationResponse {
    /// Answer a verified request, signing the id token.
    ///
    /// Presentations are checked against the request's definitions before anything is signed.
    pub async fn from_verified_request(
        verified: &VerifiedAuthorizationRequest,
        opts: &AuthorizationResponseOpts,
        http_client: &dyn AsyncHttpClient,
        engine: &dyn EvaluationEngine,
    ) -> Result<Self> {
        let request = &verified.payload;
        let client_id = request
            .client_id()
            .ok_or_else(|| Error::BadParams("the request has no client_id".into()))?;
        let vps = opts
            .presentation_exchange
            .as_ref()
            .map(|pe| pe.vps.as_slice())
            .unwrap_or_default();

        let mut submission = opts
            .presentation_exchange
            .as_ref()
            .and_then(|pe| pe.presentation_submission.clone());
        if !verified.presentation_definitions.is_empty() {
            if vps.is_empty() {
                return Err(Error::BadParams(
                    "the request asks for presentations but none were supplied".into(),
                ));
            }
            let validated = PresentationExchange::validate_payloads_against_definitions(
                &verified.presentation_definitions,
                vps,
                submission.as_ref(),
                None,
                engine,
            )
            .await?;
            if let (None, [single]) = (&submission, validated.as_slice()) {
                submission = Some(single.submission.clone());
            }
        }

        let iat = now();
        let mut claims = UntypedObject::new();
        claims.insert_raw("iss", Json::String(SELF_ISSUED_ISSUER.into()));
        claims.insert(Subject(opts.signature.did().to_string()));
        claims.insert(Audience(client_id));
        claims.insert_raw("iat", iat.into());
        claims.insert_raw("exp", (iat + opts.expires_in).into());
        let nonce = opts.nonce.clone().or_else(|| request.nonce());
        let state = opts.state.clone().or_else(|| request.state());
        if let Some(nonce) = nonce {
            claims.insert(Nonce(nonce));
        }
        if let Some(state) = &state {
            claims.insert(State(state.clone()));
        }
        if let Some(submission) = &submission {
            claims.insert_raw(
                "_vp_token",
                json!({ "presentation_submission": Json::from(submission.clone()) }),
            );
        }
        if let Some(registration) = &opts.registration {
            claims.insert_raw("registration", registration.clone());
        }

        let id_token = opts
            .signature
            .sign_jwt(claims.as_map(), http_client)
            .await?;

        let mut payload = UntypedObject::new();
        payload.insert(IdToken(id_token));
        match vps {
            [] => {}
            [single] => {
                payload.insert(VpToken::Single(single.original.clone()));
            }
            many => {
                payload.insert(VpToken::Many(
                    many.iter().map(|vp| vp.original.clone()).collect(),
                ));
            }
        }
        if let Some(submission) = submission {
            payload.insert(submission);
        }
        if let Some(state) = state {
            payload.insert(State(state));
        }

        let redirect_uri = request
            .get_str("response_uri")
            .or_else(|| request.get_str("redirect_uri"))
            .and_then(|uri| Url::parse(uri).ok());

        debug!("created authorization response for {}", opts.signature.did());
        Ok(Self {
            payload: AuthorizationResponsePayload(payload),
            id_token_payload: claims,
            redirect_uri,
        })
    }

    /// Wrap a received response.
    pub fn from_payload(payload: AuthorizationResponsePayload) -> Result<Self> {
        let id_token = payload.id_token().validation()?;
        let decoded = super::jwt::decode(&id_token.0).validation()?;
        Ok(Self {
            payload,
            id_token_payload: decoded.payload,
            redirect_uri: None,
        })
    }

    pub fn payload(&self) -> &AuthorizationResponsePayload {
        &self.payload
    }

    /// The claims of the id token, not verified.
    pub fn id_token_payload(&self) -> &UntypedObject {
        &self.id_token_payload
    }

    /// Where the response goes, taken from the request it answers.
    pub fn redirect_uri(&self) -> Option<&Url> {
        self.redirect_uri.as_ref()
    }

    pub async fn verify(
        &self,
        opts: &VerifyAuthorizationResponseOpts,
    ) -> Result<VerifiedAuthorizationResponse> {
        let id_token = self.payload.id_token().validation()?;
        let id_token = verify_did_jwt(&id_token.0, opts.resolver.as_ref(), None).await?;
        let claims = &id_token.decoded.payload;

        if !opts.supported_versions.is_empty() {
            let unsupported = opts
                .presentation_definitions
                .iter()
                .filter_map(|d| d.version)
                .find(|v| !opts.supported_versions.contains(v));
            if let Some(version) = unsupported {
                return Err(Error::UnsupportedVersion(format!(
                    "the request was answered as {version}, expected one of {:?}",
                    opts.supported_versions
                )));
            }
        }

        let audience = claims.get::<Audience>().parsing_error().validation()?;
        if audience.0 != opts.audience {
            return Err(Error::ValidationFailure(format!(
                "id token is meant for '{}', not '{}'",
                audience.0, opts.audience
            )));
        }
        let subject = claims.get::<Subject>().parsing_error().validation()?;
        if subject.0 != id_token.issuer {
            return Err(Error::ValidationFailure(format!(
                "id token is about '{}' but signed by '{}'",
                subject.0, id_token.issuer
            )));
        }
        match claims.get_str("iss") {
            Some(iss) if iss == SELF_ISSUED_ISSUER || iss == subject.0 => {}
            iss => {
                return Err(Error::ValidationFailure(format!(
                    "{iss:?} is not a self-issued issuer"
                )))
            }
        }

        if let Some(nonce) = &opts.nonce {
            let found = claims.get::<Nonce>().and_then(|n| n.ok()).map(|n| n.0);
            if found.as_deref() != Some(nonce.as_str()) {
                return Err(Error::NonceOrStateMismatch(format!(
                    "expected nonce '{nonce}', the id token carries {found:?}"
                )));
            }
        }
        if let Some(state) = &opts.state {
            let found = self
                .payload
                .state()
                .or_else(|| claims.get::<State>().and_then(|s| s.ok()).map(|s| s.0));
            if found.as_deref() != Some(state.as_str()) {
                return Err(Error::NonceOrStateMismatch(format!(
                    "expected state '{state}', the response carries {found:?}"
                )));
            }
        }

        let mut presentations = vec![];
        if !opts.presentation_definitions.is_empty() {
            let vp_token = self
                .payload
                .vp_token()
                .ok_or_else(|| {
                    Error::PresentationMatchFailure("the response carries no vp_token".into())
                })?
                .validation()?;
            let vps = VerifiablePresentationPayload::from_vp_token(&Json::from(vp_token))?;
            let submission = match self.payload.presentation_submission() {
                Some(submission) => Some(submission.validation()?),
                None => claims
                    .get_raw("_vp_token")
                    .and_then(|v| v.get(PresentationSubmission::KEY))
                    .cloned()
                    .map(PresentationSubmission::try_from)
                    .transpose()
                    .validation()?,
            };
            presentations = PresentationExchange::validate_payloads_against_definitions(
                &opts.presentation_definitions,
                &vps,
                submission.as_ref(),
                opts.verification_callback.as_ref(),
                opts.engine.as_ref(),
            )
            .await?;
        }

        if opts.check_linked_domain != CheckLinkedDomain::Never {
            let http_client = opts.http_client.as_deref().ok_or_else(|| {
                Error::LinkedDomainFailure("domain linkage checks need an http client".into())
            })?;
            validate_linked_domain_with_did(
                &id_token.issuer,
                opts.check_linked_domain,
                opts.domain_linkage_verifier.as_ref(),
                opts.resolver.as_ref(),
                http_client,
            )
            .await?;
        }

        debug!("verified authorization response from {}", subject.0);
        Ok(VerifiedAuthorizationResponse {
            subject: subject.0,
            id_token,
            presentations,
            payload: self.payload.clone(),
        })
    }
}

/// Post `response` form encoded to `redirect_uri`.
pub async fn post_authorization_response(
    http_client: &dyn AsyncHttpClient,
    redirect_uri: &Url,
    response: &AuthorizationResponse,
) -> Result<http::Response<Vec<u8>>> {
    let form = response.payload.to_form()?;
    debug!("posting authorization response to {redirect_uri}");
    post_form(http_client, redirect_uri, &form)
        .await
        .map_err(|e| match e {
            Error::ExternalFetchFailure(_) => e,
            other => Error::ExternalFetchFailure(other.to_string()),
        })
}

#[derive(Clone)]
pub struct VerifyAuthorizationResponseOpts {
    pub resolver: Arc<dyn DidResolver>,
    /// The client id of the RP; the id token must be meant for it.
    pub audience: String,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub presentation_definitions: Vec<PresentationDefinitionWithLocation>,
    pub verification_callback: Option<Arc<dyn PresentationVerificationCallback>>,
    pub engine: Arc<dyn EvaluationEngine>,
    /// Dialects the answered request may have been in. Empty accepts every dialect.
    pub supported_versions: Vec<SupportedVersion>,
    /// Domain linkage of the OP's DID; `Never` unless set.
    pub check_linked_domain: CheckLinkedDomain,
    pub domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
    pub http_client: Option<Arc<dyn AsyncHttpClient>>,
}

impl fmt::Debug for VerifyAuthorizationResponseOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyAuthorizationResponseOpts")
            .field("audience", &self.audience)
            .field("nonce", &self.nonce)
            .field("state", &self.state)
            .field("presentation_definitions", &self.presentation_definitions)
            .field("supported_versions", &self.supported_versions)
            .field("check_linked_domain", &self.check_linked_domain)
            .finish_non_exhaustive()
    }
}

impl VerifyAuthorizationResponseOpts {
    pub fn new(resolver: Arc<dyn DidResolver>, audience: impl Into<String>) -> Self {
        Self {
            resolver,
            audience: audience.into(),
            nonce: None,
            state: None,
            presentation_definitions: vec![],
            verification_callback: None,
            engine: Arc::new(JsonPathEvaluator),
            supported_versions: vec![],
            check_linked_domain: CheckLinkedDomain::Never,
            domain_linkage_verifier: None,
            http_client: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_presentation_definitions(
        mut self,
        definitions: Vec<PresentationDefinitionWithLocation>,
    ) -> Self {
        self.presentation_definitions = definitions;
        self
    }

    pub fn with_verification_callback(
        mut self,
        callback: Arc<dyn PresentationVerificationCallback>,
    ) -> Self {
        self.verification_callback = Some(callback);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn EvaluationEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<SupportedVersion>) -> Self {
        self.supported_versions = versions;
        self
    }

    /// Check the domain linkage of the OP's DID, fetching configurations with `http_client`.
    pub fn with_check_linked_domain(
        mut self,
        policy: CheckLinkedDomain,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Self {
        self.check_linked_domain = policy;
        self.http_client = Some(http_client);
        self
    }

    pub fn with_domain_linkage_verifier(mut self, verifier: Arc<dyn DomainLinkageVerifier>) -> Self {
        self.domain_linkage_verifier = Some(verifier);
        self
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedAuthorizationResponse {
    /// The DID of the OP.
    pub subject: String,
    pub id_token: VerifiedJwt,
    pub presentations: Vec<ValidatedPresentation>,
    pub payload: AuthorizationResponsePayload,
}

impl fmt::Display for AuthorizationResponsePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let form = self.to_form().map_err(|_| fmt::Error)?;
        let body = serde_urlencoded::to_string(form).map_err(|_| fmt::Error)?;
        body.fmt(f)
    }
}

impl TryFrom<Json> for AuthorizationResponsePayload {
    type Error = anyhow::Error;

    fn try_from(value: Json) -> anyhow::Result<Self> {
        UntypedObject::try_from(value)
            .context("a response payload is a JSON object")
            .map(Self)
    }
}
