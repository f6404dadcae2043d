//! The self-issued OpenID provider: verifies requests and answers them.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;

use crate::config::OpConfig;
use crate::core::authorization_request::opts::VerifyAuthorizationRequestOpts;
use crate::core::authorization_request::{AuthorizationRequest, VerifiedAuthorizationRequest};
use crate::core::did::{DidResolver, ResolverRegistry};
use crate::core::linked_domain::{CheckLinkedDomain, DomainLinkageVerifier};
use crate::core::presentation_exchange::evaluation::{EvaluationEngine, JsonPathEvaluator};
use crate::core::response::{
    post_authorization_response, AuthorizationResponse, AuthorizationResponseOpts,
    PresentationExchangeResponseOpts, DEFAULT_ID_TOKEN_EXPIRES_IN,
};
use crate::core::signer::SignatureType;
use crate::core::util::{AsyncHttpClient, ReqwestClient};
use crate::core::version::SupportedVersion;
use crate::error::{Error, ErrorKind, Result};

/// Per response values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseParams {
    pub presentation_exchange: Option<PresentationExchangeResponseOpts>,
    /// Overrides the nonce and state of the request.
    pub nonce: Option<String>,
    pub state: Option<String>,
}

/// A configured self-issued OpenID provider.
#[derive(Clone)]
pub struct Op {
    signature: SignatureType,
    registration: Option<Json>,
    expires_in: u64,
    supported_versions: Vec<SupportedVersion>,
    check_linked_domain: CheckLinkedDomain,
    domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
    resolver: Arc<ResolverRegistry>,
    engine: Arc<dyn EvaluationEngine>,
    http_client: Arc<dyn AsyncHttpClient>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("did", &self.signature.did())
            .field("expires_in", &self.expires_in)
            .field("supported_versions", &self.supported_versions)
            .field("check_linked_domain", &self.check_linked_domain)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Op {
    pub fn builder() -> OpBuilder {
        OpBuilder::default()
    }

    pub fn did(&self) -> &str {
        self.signature.did()
    }

    pub fn resolver(&self) -> Arc<dyn DidResolver> {
        self.resolver.clone()
    }

    fn verify_opts(&self, nonce: Option<&str>) -> VerifyAuthorizationRequestOpts {
        let mut opts =
            VerifyAuthorizationRequestOpts::new(self.resolver.clone(), self.http_client.clone())
                .with_supported_versions(self.supported_versions.clone())
                .with_check_linked_domain(self.check_linked_domain);
        if let Some(nonce) = nonce {
            opts = opts.with_nonce(nonce);
        }
        if let Some(verifier) = &self.domain_linkage_verifier {
            opts = opts.with_domain_linkage_verifier(verifier.clone());
        }
        opts
    }

    /// Parse and verify a request URI or bare request object token.
    pub async fn verify_authorization_request(
        &self,
        uri_or_jwt: &str,
        nonce: Option<&str>,
    ) -> Result<VerifiedAuthorizationRequest> {
        let verified =
            AuthorizationRequest::verify_uri_or_jwt(uri_or_jwt, &self.verify_opts(nonce)).await?;
        debug!("verified authorization request from {:?}", verified.issuer());
        Ok(verified)
    }

    pub async fn create_authorization_response(
        &self,
        verified: &VerifiedAuthorizationRequest,
        params: ResponseParams,
    ) -> Result<AuthorizationResponse> {
        let mut opts =
            AuthorizationResponseOpts::new(self.signature.clone()).with_expires_in(self.expires_in);
        opts.registration = self.registration.clone();
        opts.nonce = params.nonce;
        opts.state = params.state;
        opts.presentation_exchange = params.presentation_exchange;
        AuthorizationResponse::from_verified_request(
            verified,
            &opts,
            self.http_client.as_ref(),
            self.engine.as_ref(),
        )
        .await
    }

    /// Post the response to the URI of the request it answers.
    pub async fn submit_authorization_response(
        &self,
        response: &AuthorizationResponse,
    ) -> Result<http::Response<Vec<u8>>> {
        let redirect_uri = response.redirect_uri().ok_or_else(|| {
            Error::BadParams("the request named no redirect_uri to respond to".into())
        })?;
        post_authorization_response(self.http_client.as_ref(), redirect_uri, response).await
    }
}

/// Builder struct for [Op].
#[derive(Clone, Default)]
pub struct OpBuilder {
    did: Option<String>,
    signature: Option<SignatureType>,
    registration: Option<Json>,
    expires_in: Option<u64>,
    supported_versions: Option<Vec<SupportedVersion>>,
    check_linked_domain: CheckLinkedDomain,
    domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
    resolver: ResolverRegistry,
    engine: Option<Arc<dyn EvaluationEngine>>,
    http_client: Option<Arc<dyn AsyncHttpClient>>,
}

impl fmt::Debug for OpBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpBuilder")
            .field("did", &self.did)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl OpBuilder {
    /// Seed a builder with static settings.
    pub fn from_config(config: OpConfig) -> Result<Self> {
        let mut builder = Self::default()
            .with_did(config.did)
            .with_supported_versions(config.supported_versions)
            .with_check_linked_domain(config.check_linked_domain);
        builder.expires_in = config.expires_in;
        builder.registration = config.registration;
        if let Some(signature) = config.signature {
            builder = builder.with_signature(SignatureType::try_from(signature)?);
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<Op> {
        let Self {
            did,
            signature,
            registration,
            expires_in,
            supported_versions,
            check_linked_domain,
            domain_linkage_verifier,
            resolver,
            engine,
            http_client,
        } = self;

        let Some(signature) = signature else {
            return Err(Error::BadSignatureParams(
                "a signature is required, see `with_signature`".into(),
            ));
        };
        if let Some(did) = did {
            if did != signature.did() {
                return Err(Error::BadSignatureParams(format!(
                    "'{did}' cannot sign with a key of '{}'",
                    signature.did()
                )));
            }
        }
        if check_linked_domain == CheckLinkedDomain::Always && domain_linkage_verifier.is_none() {
            return Err(Error::BadParams(
                "checking linked domains requires a verifier, see `with_domain_linkage_verifier`"
                    .into(),
            ));
        }

        let http_client = match http_client {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new().fetch()?),
        };

        Ok(Op {
            signature,
            registration,
            expires_in: expires_in.unwrap_or(DEFAULT_ID_TOKEN_EXPIRES_IN),
            supported_versions: supported_versions.unwrap_or_else(|| SupportedVersion::ALL.to_vec()),
            check_linked_domain,
            domain_linkage_verifier,
            resolver: Arc::new(resolver),
            engine: engine.unwrap_or_else(|| Arc::new(JsonPathEvaluator)),
            http_client,
        })
    }

    pub fn with_did(mut self, did: impl Into<String>) -> Self {
        self.did = Some(did.into());
        self
    }

    pub fn with_signature(mut self, signature: SignatureType) -> Self {
        self.signature = Some(signature);
        self
    }

    /// OP metadata, sent as the `registration` claim of the id token.
    pub fn with_registration(mut self, registration: Json) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn with_expires_in(mut self, expires_in: u64) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<SupportedVersion>) -> Self {
        self.supported_versions = Some(versions);
        self
    }

    pub fn with_check_linked_domain(mut self, policy: CheckLinkedDomain) -> Self {
        self.check_linked_domain = policy;
        self
    }

    pub fn with_domain_linkage_verifier(mut self, verifier: Arc<dyn DomainLinkageVerifier>) -> Self {
        self.domain_linkage_verifier = Some(verifier);
        self
    }

    pub fn with_did_resolver(mut self, method: impl Into<String>, resolver: Arc<dyn DidResolver>) -> Self {
        self.resolver = self.resolver.with_method(method, resolver);
        self
    }

    pub fn with_default_resolver(mut self, resolver: Arc<dyn DidResolver>) -> Self {
        self.resolver = self.resolver.with_default(resolver);
        self
    }

    pub fn with_resolver_registry(mut self, registry: ResolverRegistry) -> Self {
        self.resolver = registry;
        self
    }

    pub fn with_evaluation_engine(mut self, engine: Arc<dyn EvaluationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn AsyncHttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::core::signer::{P256Signer, SuppliedSignature};
    use crate::core::util::test_utils::MockHttpClient;

    fn signature(did: &str) -> SignatureType {
        SignatureType::Supplied(SuppliedSignature {
            signer: Arc::new(
                P256Signer::new(p256::ecdsa::SigningKey::random(&mut rand::thread_rng())).unwrap(),
            ),
            did: did.into(),
            kid: format!("{did}#key-1"),
        })
    }

    #[test]
    fn required_settings() {
        let err = Op::builder().build().unwrap_err();
        assert!(matches!(err, Error::BadSignatureParams(_)));

        let err = Op::builder()
            .with_did("did:example:a")
            .with_signature(signature("did:example:b"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadSignatureParams(_)));

        let err = Op::builder()
            .with_signature(signature("did:example:op"))
            .with_check_linked_domain(CheckLinkedDomain::Always)
            .with_http_client(Arc::new(MockHttpClient::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
    }

    #[test]
    fn from_config() {
        let config: OpConfig = serde_json::from_value(json!({
            "did": "did:example:op",
            "expires_in": 60,
            "signature": {
                "signatureUri": "https://signer.example/sign",
                "authZToken": "token",
                "did": "did:example:op",
                "kid": "did:example:op#key-1",
                "alg": "ES256"
            }
        }))
        .unwrap();
        let op = OpBuilder::from_config(config)
            .unwrap()
            .with_http_client(Arc::new(MockHttpClient::default()))
            .build()
            .unwrap();
        assert_eq!(op.did(), "did:example:op");
        assert_eq!(op.expires_in, 60);
    }

    #[tokio::test]
    async fn empty_request() {
        let op = Op::builder()
            .with_signature(signature("did:example:op"))
            .with_http_client(Arc::new(MockHttpClient::default()))
            .build()
            .unwrap();
        let err = op
            .verify_authorization_request("", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParams(_)));
    }
}
