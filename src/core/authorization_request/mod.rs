use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use self::opts::{
    assert_valid_authorization_request_opts, CreateAuthorizationRequestOpts,
    VerifyAuthorizationRequestOpts,
};
use self::parameters::Request;
use self::payload::{create_authorization_request_payload, AuthorizationRequestPayload};
use self::uri::Uri;

use super::did::{verify_did_jwt, VerifiedJwt};
use super::jwt;
use super::linked_domain::{validate_linked_domain_with_did, CheckLinkedDomain};
use super::metadata::{assert_valid_rp_registration_metadata, RpRegistrationMetadataPayload};
use super::presentation_exchange::{PresentationDefinitionWithLocation, PresentationExchange};
use super::request_object::RequestObject;
use super::util::{fetch_by_reference_or_use_by_value, AsyncHttpClient};
use super::version::{check_version_supported, SupportedVersion};
use crate::error::{Error, Result};

pub mod opts;
pub mod parameters;
pub mod payload;
pub mod uri;

/// An Authorization Request, built from options or parsed from its wire form.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    payload: AuthorizationRequestPayload,
    request_object: Option<Arc<RequestObject>>,
    options: Option<CreateAuthorizationRequestOpts>,
    /// The request object token, once known, for payloads that did not carry it by value.
    backfilled_request: OnceLock<String>,
    uri: OnceLock<Uri>,
}

/// What a caller needs to correlate a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStateInfo {
    pub client_id: Option<String>,
    pub iat: Option<u64>,
    pub nonce: Option<String>,
    pub state: Option<String>,
}

/// A request that passed every verification gate.
#[derive(Debug, Clone)]
pub struct VerifiedAuthorizationRequest {
    /// The outer payload overlaid with the verified request object.
    pub payload: AuthorizationRequestPayload,
    pub verified_jwt: Option<VerifiedJwt>,
    pub registration_metadata: RpRegistrationMetadataPayload,
    pub presentation_definitions: Vec<PresentationDefinitionWithLocation>,
    /// Ascending; the last one is the negotiated dialect.
    pub versions: Vec<SupportedVersion>,
    pub authorization_request: AuthorizationRequest,
}

impl VerifiedAuthorizationRequest {
    pub fn issuer(&self) -> Option<&str> {
        self.verified_jwt.as_ref().map(|v| v.issuer.as_str())
    }

    pub fn version(&self) -> Option<SupportedVersion> {
        self.versions.last().copied()
    }
}

impl AuthorizationRequest {
    fn new(
        payload: AuthorizationRequestPayload,
        request_object: Option<RequestObject>,
        options: Option<CreateAuthorizationRequestOpts>,
    ) -> Self {
        Self {
            payload,
            request_object: request_object.map(Arc::new),
            options,
            backfilled_request: OnceLock::new(),
            uri: OnceLock::new(),
        }
    }

    /// Build a request, signing its request object unless it is omitted.
    pub async fn from_opts(
        opts: CreateAuthorizationRequestOpts,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Result<Self> {
        assert_valid_authorization_request_opts(&opts)?;
        let opts = opts.with_defaults();

        let request_object = RequestObject::from_opts(&opts, http_client)?;
        if let Some(request_object) = &request_object {
            // Sign now so that a reference can be served and the token never changes.
            request_object.to_jwt().await?;
        }
        let payload = create_authorization_request_payload(&opts, request_object.as_ref()).await?;
        debug!(
            "created authorization request for {:?}",
            payload.client_id()
        );
        Ok(Self::new(payload, request_object, Some(opts)))
    }

    /// Wrap a raw payload, taking its request object from `request` or fetching `request_uri`.
    pub async fn from_payload(
        payload: AuthorizationRequestPayload,
        http_client: &dyn AsyncHttpClient,
    ) -> Result<Self> {
        let request_object =
            RequestObject::from_authorization_request_payload(&payload, http_client).await?;
        Ok(Self::new(payload, request_object, None))
    }

    /// Parse a request object received as a bare compact token.
    pub fn from_jwt(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Err(Error::BadParams("an empty token is not a request".into()));
        }
        let request_object = RequestObject::from_jwt(token)?;
        let mut payload = AuthorizationRequestPayload(request_object.payload().clone());
        payload.insert(Request(token.to_string()));
        Ok(Self::new(payload, Some(request_object), None))
    }

    /// Parse a request URI, fetching the request object it references.
    pub async fn from_uri(uri: &str, http_client: &dyn AsyncHttpClient) -> Result<Self> {
        let uri = Uri::from_uri(uri, http_client).await?;
        let request_object = uri
            .request_object_jwt()
            .map(RequestObject::from_jwt)
            .transpose()?;
        let request = Self::new(
            uri.authorization_request_payload().clone(),
            request_object,
            None,
        );
        let _ = request.uri.set(uri);
        Ok(request)
    }

    pub async fn from_uri_or_jwt(value: &str, http_client: &dyn AsyncHttpClient) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::BadParams("neither a request uri nor a token".into()));
        }
        if jwt::is_compact_jwt(value) {
            Self::from_jwt(value)
        } else {
            Self::from_uri(value, http_client).await
        }
    }

    /// Parse and verify in one go.
    pub async fn verify_uri_or_jwt(
        value: &str,
        opts: &VerifyAuthorizationRequestOpts,
    ) -> Result<VerifiedAuthorizationRequest> {
        opts.assert_valid()?;
        Self::from_uri_or_jwt(value, opts.http_client.as_ref())
            .await?
            .verify(opts)
            .await
    }

    /// A copy of the payload, including a backfilled `request`.
    pub fn payload(&self) -> AuthorizationRequestPayload {
        let mut payload = self.payload.clone();
        if let Some(request) = self.backfilled_request.get() {
            payload.insert(Request(request.clone()));
        }
        payload
    }

    pub fn request_object(&self) -> Option<&RequestObject> {
        self.request_object.as_deref()
    }

    pub fn has_request_object(&self) -> bool {
        self.request_object.is_some()
    }

    pub fn options(&self) -> Option<&CreateAuthorizationRequestOpts> {
        self.options.as_ref()
    }

    pub async fn request_object_jwt(&self) -> Result<Option<String>> {
        match &self.request_object {
            Some(request_object) => request_object.to_jwt().await,
            None => Ok(None),
        }
    }

    /// The wire form of this request, encoded on first use.
    pub async fn uri(&self) -> Result<Uri> {
        if let Some(uri) = self.uri.get() {
            return Ok(uri.clone());
        }
        let uri = Uri::from_authorization_request(self).await?;
        Ok(self.uri.get_or_init(|| uri).clone())
    }

    pub fn to_state_info(&self) -> RequestStateInfo {
        let request_object = self.request_object.as_ref().map(|ro| ro.payload());
        let field = |key: &str| {
            request_object
                .and_then(|ro| ro.get_raw(key))
                .or_else(|| self.payload.get_raw(key))
        };
        RequestStateInfo {
            client_id: field("client_id").and_then(Json::as_str).map(str::to_string),
            iat: field("iat").and_then(Json::as_u64),
            nonce: field("nonce").and_then(Json::as_str).map(str::to_string),
            state: self.payload.state(),
        }
    }

    /// Run every verification gate, in order, stopping at the first failure.
    pub async fn verify(&self, opts: &VerifyAuthorizationRequestOpts) -> Result<VerifiedAuthorizationRequest> {
        opts.assert_valid()?;
        let http_client = opts.http_client.as_ref();

        let mut verified_jwt = None;
        if let Some(token) = self.request_object_jwt().await? {
            let verified = verify_did_jwt(&token, opts.resolver.as_ref(), None).await?;
            if self.payload.request().is_none() {
                let _ = self.backfilled_request.set(token);
            }
            verified_jwt = Some(verified);
        }

        let merged: AuthorizationRequestPayload = match &verified_jwt {
            Some(verified) => self.payload().0.merge(&verified.decoded.payload).into(),
            None => self.payload(),
        };

        let versions = check_version_supported(&merged, &opts.supported_versions)?;

        if let Some(nonce) = &opts.nonce {
            let found = merged.nonce();
            if found.as_deref() != Some(nonce.as_str()) {
                return Err(Error::NonceOrStateMismatch(format!(
                    "expected nonce '{nonce}', the request carries {found:?}"
                )));
            }
        }

        let reference = merged
            .get_str("registration_uri")
            .or_else(|| merged.get_str("client_metadata_uri"));
        let value = merged
            .get_raw("registration")
            .or_else(|| merged.get_raw("client_metadata"));
        let metadata = fetch_by_reference_or_use_by_value(http_client, reference, value).await?;
        let registration_metadata = assert_valid_rp_registration_metadata(metadata.as_ref())?;

        let signer_did = verified_jwt.as_ref().map(|v| v.issuer.clone());
        let did = merged
            .client_id()
            .filter(|id| id.starts_with("did:"))
            .or(signer_did);
        match (opts.check_linked_domain, did) {
            (CheckLinkedDomain::Never, _) => {}
            (CheckLinkedDomain::Always, None) => {
                return Err(Error::LinkedDomainFailure(
                    "the request is not tied to a DID".into(),
                ))
            }
            (CheckLinkedDomain::IfPresent, None) => {
                debug!("request is not tied to a DID, skipping the linked domain check")
            }
            (policy, Some(did)) => {
                validate_linked_domain_with_did(
                    &did,
                    policy,
                    opts.domain_linkage_verifier.as_ref(),
                    opts.resolver.as_ref(),
                    http_client,
                )
                .await?
            }
        }

        let presentation_definitions = PresentationExchange::find_valid_presentation_definitions(
            &merged,
            versions.last().copied(),
            http_client,
        )
        .await?;

        debug!(
            "verified authorization request from {:?} ({} presentation definitions)",
            merged.client_id(),
            presentation_definitions.len()
        );

        Ok(VerifiedAuthorizationRequest {
            payload: merged,
            verified_jwt,
            registration_metadata,
            presentation_definitions,
            versions,
            authorization_request: self.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::opts::{ClientMetadataOpts, MetadataOpts, PassBy, RequestObjectOpts};
    use super::*;
    use crate::core::did::test::{document_for, StaticResolver};
    use crate::core::signer::{InternalSignature, K256Signer, RequestSigner, SignatureType};
    use crate::core::util::test_utils::MockHttpClient;

    const HEX_KEY: &str = "f857544a9d1097e242ff0b287a7e6e90f19cf973efe2317f2a4678739664420f";
    const DID: &str = "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0";
    const KID: &str = "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0#key-1";

    fn opts(pass_by: PassBy) -> CreateAuthorizationRequestOpts {
        CreateAuthorizationRequestOpts {
            client_id: Some("test_client_id".into()),
            redirect_uri: Some("https://acme.com/hello".parse().unwrap()),
            scope: Some("test".into()),
            request_object: Some(RequestObjectOpts {
                pass_by,
                reference_uri: Some("https://rp.acme.com/siop/jwts".parse().unwrap()),
                signature: Some(SignatureType::Internal(InternalSignature {
                    hex_private_key: HEX_KEY.into(),
                    did: DID.into(),
                    kid: KID.into(),
                    alg: None,
                })),
            }),
            client_metadata: Some(ClientMetadataOpts::Registration(MetadataOpts {
                pass_by: PassBy::Value,
                reference_uri: None,
                metadata: RpRegistrationMetadataPayload {
                    subject_syntax_types_supported: vec!["did:ethr:".into(), "did".into()],
                    ..Default::default()
                },
            })),
            ..Default::default()
        }
    }

    fn resolver() -> Arc<StaticResolver> {
        let document = document_for(DID, K256Signer::from_hex(HEX_KEY).unwrap().jwk());
        Arc::new(StaticResolver::default().with(document))
    }

    fn verify_opts(client: MockHttpClient) -> VerifyAuthorizationRequestOpts {
        VerifyAuthorizationRequestOpts::new(resolver(), Arc::new(client))
            .with_check_linked_domain(CheckLinkedDomain::Never)
    }

    #[tokio::test]
    async fn by_value_verifies_and_keeps_request() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Value), client)
            .await
            .unwrap();
        let token = request.payload().request().unwrap().to_string();
        assert!(jwt::is_compact_jwt(&token));

        let verified = request
            .verify(&verify_opts(MockHttpClient::default()))
            .await
            .unwrap();
        assert_eq!(verified.issuer(), Some(DID));
        assert_eq!(verified.payload.get_str("scope"), Some("openid"));
        assert_eq!(
            verified.registration_metadata.subject_syntax_types_supported,
            vec!["did:ethr:", "did"]
        );
        assert!(verified.versions.contains(&SupportedVersion::SiopV2Id1));
    }

    #[tokio::test]
    async fn by_reference_backfills_request() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Reference), client)
            .await
            .unwrap();
        assert_eq!(
            request.payload().request_uri(),
            Some("https://rp.acme.com/siop/jwts")
        );
        assert!(request.payload().request().is_none());

        let verified = request
            .verify(&verify_opts(MockHttpClient::default()))
            .await
            .unwrap();
        let token = request.request_object_jwt().await.unwrap();
        assert_eq!(request.payload().request(), token.as_deref());
        assert_eq!(verified.authorization_request.payload().request(), token.as_deref());
    }

    #[tokio::test]
    async fn unsigned_flattens() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::None), client)
            .await
            .unwrap();
        assert!(!request.has_request_object());
        let payload = request.payload();
        assert!(payload.request().is_none() && payload.request_uri().is_none());
        assert_eq!(payload.client_id().as_deref(), Some("test_client_id"));
        assert!(payload.contains("registration"));

        request
            .verify(&verify_opts(MockHttpClient::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonce_mismatch() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Value), client)
            .await
            .unwrap();
        let err = request
            .verify(&verify_opts(MockHttpClient::default()).with_nonce("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonceOrStateMismatch(_)));

        let nonce = request.to_state_info().nonce.unwrap();
        request
            .verify(&verify_opts(MockHttpClient::default()).with_nonce(nonce))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gates_run_in_order() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Value), client)
            .await
            .unwrap();

        // An unsupported dialect is reported before the nonce.
        let err = request
            .verify(
                &verify_opts(MockHttpClient::default())
                    .with_nonce("other")
                    .with_supported_versions(vec![SupportedVersion::SiopV2D11]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(_)));

        // Signature problems come first of all.
        let opts = VerifyAuthorizationRequestOpts::new(
            Arc::new(StaticResolver::default()),
            Arc::new(MockHttpClient::default()),
        )
        .with_nonce("other");
        let err = request.verify(&opts).await.unwrap_err();
        assert!(matches!(err, Error::SignatureVerificationFailure(_)));
    }

    #[tokio::test]
    async fn always_without_verifier() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Value), client)
            .await
            .unwrap();
        let err = request
            .verify(
                &verify_opts(MockHttpClient::default())
                    .with_check_linked_domain(CheckLinkedDomain::Always),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
    }

    #[tokio::test]
    async fn registration_is_required() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let mut o = opts(PassBy::Value);
        o.client_metadata = None;
        let request = AuthorizationRequest::from_opts(o, client).await.unwrap();
        let err = request
            .verify(&verify_opts(MockHttpClient::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn registration_by_reference() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let mut o = opts(PassBy::Value);
        o.client_metadata = Some(ClientMetadataOpts::Registration(MetadataOpts {
            pass_by: PassBy::Reference,
            reference_uri: Some("https://rp.acme.com/registration".parse().unwrap()),
            metadata: Default::default(),
        }));
        let request = AuthorizationRequest::from_opts(o, client).await.unwrap();

        let http = MockHttpClient::default().with_json(
            "https://rp.acme.com/registration",
            json!({ "subject_syntax_types_supported": ["did:ethr:"] }),
        );
        let verified = request.verify(&verify_opts(http)).await.unwrap();
        assert_eq!(
            verified.registration_metadata.subject_syntax_types_supported,
            vec!["did:ethr:"]
        );

        let err = request
            .verify(&verify_opts(MockHttpClient::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalFetchFailure(_)));
    }

    #[tokio::test]
    async fn empty_input() {
        let err = AuthorizationRequest::from_uri_or_jwt("", &MockHttpClient::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
    }

    #[tokio::test]
    async fn uri_is_cached() {
        let client: Arc<dyn AsyncHttpClient> = Arc::new(MockHttpClient::default());
        let request = AuthorizationRequest::from_opts(opts(PassBy::Value), client)
            .await
            .unwrap();
        let first = request.uri().await.unwrap();
        let second = request.uri().await.unwrap();
        assert_eq!(first, second);

        let parsed = AuthorizationRequest::from_uri_or_jwt(
            first.encoded_uri(),
            &MockHttpClient::default(),
        )
        .await
        .unwrap();
        assert_eq!(parsed.payload(), request.payload());
    }
}
