//! The relying party: creates authorization requests and verifies the responses to them.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;
use url::Url;

use crate::config::{BaseUrl, RpConfig};
use crate::core::authorization_request::opts::{
    ClientMetadataOpts, CreateAuthorizationRequestOpts, MetadataOpts, PassBy, RequestObjectOpts,
};
use crate::core::authorization_request::uri::Uri;
use crate::core::authorization_request::AuthorizationRequest;
use crate::core::did::{DidResolver, ResolverRegistry};
use crate::core::linked_domain::{CheckLinkedDomain, DomainLinkageVerifier};
use crate::core::presentation_exchange::evaluation::{EvaluationEngine, JsonPathEvaluator};
use crate::core::presentation_exchange::{
    PresentationDefinitionWithLocation, PresentationVerificationCallback,
};
use crate::core::response::{
    AuthorizationResponse, VerifiedAuthorizationResponse, VerifyAuthorizationResponseOpts,
};
use crate::core::signer::SignatureType;
use crate::core::util::{AsyncHttpClient, ReqwestClient};
use crate::core::version::SupportedVersion;
use crate::error::{Error, ErrorKind, Result};
use crate::utils::{gen_nonce, gen_state};

/// Where a request object passed by reference is served from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ByReference {
    #[default]
    Unset,
    At(Url),
    /// `<base><state>`, one URL per request.
    Under(BaseUrl),
}

/// Per request values; fresh ones are generated when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub nonce: Option<String>,
    pub state: Option<String>,
}

/// What a response is checked against.
#[derive(Debug, Clone, Default)]
pub struct VerifyResponseParams {
    /// Defaults to the client id of the RP.
    pub audience: Option<String>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub presentation_definitions: Vec<PresentationDefinitionWithLocation>,
}

/// A configured relying party.
#[derive(Clone)]
pub struct Rp {
    client_id: String,
    redirect_uri: Url,
    scheme: Option<String>,
    scope: Option<String>,
    response_mode: Option<String>,
    pass_by: PassBy,
    by_reference: ByReference,
    signature: Option<SignatureType>,
    registration: Option<ClientMetadataOpts>,
    claims: Option<Json>,
    presentation_definition: Option<Json>,
    expires_in: Option<u64>,
    supported_versions: Vec<SupportedVersion>,
    check_linked_domain: CheckLinkedDomain,
    domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
    resolver: Arc<ResolverRegistry>,
    verification_callback: Option<Arc<dyn PresentationVerificationCallback>>,
    engine: Arc<dyn EvaluationEngine>,
    http_client: Arc<dyn AsyncHttpClient>,
}

impl fmt::Debug for Rp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rp")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("pass_by", &self.pass_by)
            .field("by_reference", &self.by_reference)
            .field("supported_versions", &self.supported_versions)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Rp {
    pub fn builder() -> RpBuilder {
        RpBuilder::default()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn supported_versions(&self) -> &[SupportedVersion] {
        &self.supported_versions
    }

    pub fn check_linked_domain(&self) -> CheckLinkedDomain {
        self.check_linked_domain
    }

    pub fn resolver(&self) -> Arc<dyn DidResolver> {
        self.resolver.clone()
    }

    /// The options a request with `params` is built from.
    pub fn request_opts(&self, params: RequestParams) -> Result<CreateAuthorizationRequestOpts> {
        let nonce = params.nonce.unwrap_or_else(gen_nonce);
        let state = params.state.unwrap_or_else(gen_state);

        let reference_uri = match &self.by_reference {
            ByReference::Unset => None,
            ByReference::At(url) => Some(url.clone()),
            ByReference::Under(base) => Some(
                base.join(&state)
                    .map_err(|e| Error::BadParams(format!("invalid reference uri: {e}")))?,
            ),
        };

        Ok(CreateAuthorizationRequestOpts {
            scheme: self.scheme.clone(),
            client_id: Some(self.client_id.clone()),
            redirect_uri: Some(self.redirect_uri.clone()),
            response_mode: self.response_mode.clone(),
            scope: self.scope.clone(),
            nonce: Some(nonce),
            state: Some(state),
            claims: self.claims.clone(),
            presentation_definition: self.presentation_definition.clone(),
            request_object: Some(RequestObjectOpts {
                pass_by: self.pass_by,
                reference_uri,
                signature: self.signature.clone(),
            }),
            client_metadata: self.registration.clone(),
            expires_in: self.expires_in,
            ..Default::default()
        })
    }

    pub async fn create_authorization_request(
        &self,
        params: RequestParams,
    ) -> Result<AuthorizationRequest> {
        let opts = self.request_opts(params)?;
        let request = AuthorizationRequest::from_opts(opts, self.http_client.clone()).await?;
        debug!(
            "created authorization request with state {:?}",
            request.payload().state()
        );
        Ok(request)
    }

    pub async fn create_authorization_request_uri(&self, params: RequestParams) -> Result<Uri> {
        self.create_authorization_request(params).await?.uri().await
    }

    pub async fn verify_authorization_response(
        &self,
        response: &AuthorizationResponse,
        params: VerifyResponseParams,
    ) -> Result<VerifiedAuthorizationResponse> {
        let mut opts = VerifyAuthorizationResponseOpts::new(
            self.resolver.clone(),
            params.audience.unwrap_or_else(|| self.client_id.clone()),
        )
        .with_presentation_definitions(params.presentation_definitions)
        .with_engine(self.engine.clone())
        .with_supported_versions(self.supported_versions.clone())
        .with_check_linked_domain(self.check_linked_domain, self.http_client.clone());
        if let Some(nonce) = params.nonce {
            opts = opts.with_nonce(nonce);
        }
        if let Some(state) = params.state {
            opts = opts.with_state(state);
        }
        if let Some(callback) = &self.verification_callback {
            opts = opts.with_verification_callback(callback.clone());
        }
        if let Some(verifier) = &self.domain_linkage_verifier {
            opts = opts.with_domain_linkage_verifier(verifier.clone());
        }
        response.verify(&opts).await
    }
}

/// Builder struct for [Rp].
#[derive(Clone, Default)]
pub struct RpBuilder {
    client_id: Option<String>,
    redirect_uri: Option<Url>,
    scheme: Option<String>,
    scope: Option<String>,
    response_mode: Option<String>,
    pass_by: PassBy,
    by_reference: ByReference,
    signature: Option<SignatureType>,
    registration: Option<ClientMetadataOpts>,
    claims: Option<Json>,
    presentation_definition: Option<Json>,
    expires_in: Option<u64>,
    supported_versions: Option<Vec<SupportedVersion>>,
    check_linked_domain: CheckLinkedDomain,
    domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
    resolver: ResolverRegistry,
    verification_callback: Option<Arc<dyn PresentationVerificationCallback>>,
    engine: Option<Arc<dyn EvaluationEngine>>,
    http_client: Option<Arc<dyn AsyncHttpClient>>,
}

impl fmt::Debug for RpBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpBuilder")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("pass_by", &self.pass_by)
            .finish_non_exhaustive()
    }
}

impl RpBuilder {
    /// Seed a builder with static settings.
    pub fn from_config(config: RpConfig) -> Result<Self> {
        let mut builder = Self::default()
            .with_client_id(config.client_id)
            .with_redirect_uri(config.redirect_uri)
            .with_supported_versions(config.supported_versions)
            .with_check_linked_domain(config.check_linked_domain);
        builder.scheme = config.scheme;
        builder.scope = config.scope;
        builder.response_mode = config.response_mode;
        builder.claims = config.claims;

        builder.pass_by = config.request_object.pass_by;
        builder.by_reference = match (
            config.request_object.reference_uri,
            config.request_object.reference_base,
        ) {
            (Some(url), _) => ByReference::At(url),
            (None, Some(base)) => ByReference::Under(base),
            (None, None) => ByReference::Unset,
        };

        let registration = MetadataOpts {
            pass_by: config.registration.pass_by,
            reference_uri: config.registration.reference_uri,
            metadata: config.registration.metadata,
        };
        builder.registration = Some(if config.registration.as_client_metadata {
            ClientMetadataOpts::ClientMetadata(registration)
        } else {
            ClientMetadataOpts::Registration(registration)
        });

        if let Some(signature) = config.signature {
            builder = builder.with_signature(SignatureType::try_from(signature)?);
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<Rp> {
        let Self {
            client_id,
            redirect_uri,
            scheme,
            scope,
            response_mode,
            pass_by,
            by_reference,
            signature,
            registration,
            claims,
            presentation_definition,
            expires_in,
            supported_versions,
            check_linked_domain,
            domain_linkage_verifier,
            resolver,
            verification_callback,
            engine,
            http_client,
        } = self;

        let Some(client_id) = client_id else {
            return Err(Error::BadParams(
                "client id is required, see `with_client_id`".into(),
            ));
        };
        let Some(redirect_uri) = redirect_uri else {
            return Err(Error::BadParams(
                "redirect uri is required, see `with_redirect_uri`".into(),
            ));
        };
        if pass_by == PassBy::Reference && by_reference == ByReference::Unset {
            return Err(Error::BadParams(
                "passing by reference requires a url, see `by_reference`".into(),
            ));
        }
        if pass_by != PassBy::None && signature.is_none() {
            return Err(Error::BadSignatureParams(
                "a request object requires a signature, see `with_signature`".into(),
            ));
        }

        let subject_syntax_types = resolver.subject_syntax_types();
        let registration = registration.map(|registration| match registration {
            ClientMetadataOpts::Registration(m) => {
                ClientMetadataOpts::Registration(with_syntax_types(m, &subject_syntax_types))
            }
            ClientMetadataOpts::ClientMetadata(m) => {
                ClientMetadataOpts::ClientMetadata(with_syntax_types(m, &subject_syntax_types))
            }
        });

        let http_client = match http_client {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new().fetch()?),
        };

        Ok(Rp {
            client_id,
            redirect_uri,
            scheme,
            scope,
            response_mode,
            pass_by,
            by_reference,
            signature,
            registration,
            claims,
            presentation_definition,
            expires_in,
            supported_versions: supported_versions.unwrap_or_else(|| SupportedVersion::ALL.to_vec()),
            check_linked_domain,
            domain_linkage_verifier,
            resolver: Arc::new(resolver),
            verification_callback,
            engine: engine.unwrap_or_else(|| Arc::new(JsonPathEvaluator)),
            http_client,
        })
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: Url) -> Self {
        self.redirect_uri = Some(redirect_uri);
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_response_mode(mut self, response_mode: impl Into<String>) -> Self {
        self.response_mode = Some(response_mode.into());
        self
    }

    /// Send every parameter at the top level, without a request object.
    pub fn unsigned(mut self) -> Self {
        self.pass_by = PassBy::None;
        self
    }

    /// Embed the signed request object in the `request` parameter.
    pub fn by_value(mut self) -> Self {
        self.pass_by = PassBy::Value;
        self
    }

    /// Serve the signed request object at `at`, referenced by `request_uri`.
    pub fn by_reference(mut self, at: Url) -> Self {
        self.pass_by = PassBy::Reference;
        self.by_reference = ByReference::At(at);
        self
    }

    /// Serve each signed request object at `<base><state>`.
    pub fn by_reference_under(mut self, base: BaseUrl) -> Self {
        self.pass_by = PassBy::Reference;
        self.by_reference = ByReference::Under(base);
        self
    }

    pub fn with_signature(mut self, signature: SignatureType) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Registration metadata, sent as `registration` or `client_metadata` depending on `opts`.
    pub fn with_registration(mut self, opts: ClientMetadataOpts) -> Self {
        self.registration = Some(opts);
        self
    }

    pub fn with_claims(mut self, claims: Json) -> Self {
        self.claims = Some(claims);
        self
    }

    /// A top level `presentation_definition`, for dialects that do not use `claims`.
    pub fn with_presentation_definition(mut self, definition: Json) -> Self {
        self.presentation_definition = Some(definition);
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

    /// When to require a verified domain linkage for the DID of a responding OP.
    pub fn with_check_linked_domain(mut self, policy: CheckLinkedDomain) -> Self {
        self.check_linked_domain = policy;
        self
    }

    pub fn with_domain_linkage_verifier(mut self, verifier: Arc<dyn DomainLinkageVerifier>) -> Self {
        self.domain_linkage_verifier = Some(verifier);
        self
    }

    /// Resolve `did:<method>:` with `resolver`, and advertise the method as supported.
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

    pub fn with_presentation_verification_callback(
        mut self,
        callback: Arc<dyn PresentationVerificationCallback>,
    ) -> Self {
        self.verification_callback = Some(callback);
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

fn with_syntax_types(mut opts: MetadataOpts, types: &[String]) -> MetadataOpts {
    opts.metadata = opts.metadata.with_subject_syntax_types(types.iter().cloned());
    opts
}
