use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use url::Url;

use crate::core::did::DidResolver;
use crate::core::linked_domain::{CheckLinkedDomain, DomainLinkageVerifier};
use crate::core::metadata::RpRegistrationMetadataPayload;
use crate::core::presentation_definition::PresentationDefinition;
use crate::core::signer::SignatureType;
use crate::core::util::AsyncHttpClient;
use crate::core::version::SupportedVersion;
use crate::error::{Error, ErrorKind, Result};
use crate::utils::{gen_nonce, gen_state};

use super::parameters::{ResponseType, Scope};

pub const DEFAULT_SCHEME: &str = "openid";
pub const DEFAULT_EXPIRES_IN: u64 = 120;

/// Whether a sub-object travels inline, by URL, or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassBy {
    #[default]
    None,
    Reference,
    Value,
}

/// How the request object is conveyed and signed.
#[derive(Debug, Clone, Default)]
pub struct RequestObjectOpts {
    pub pass_by: PassBy,
    /// Where the signed request object will be hosted, required for [PassBy::Reference].
    pub reference_uri: Option<Url>,
    pub signature: Option<SignatureType>,
}

/// How RP metadata is conveyed.
#[derive(Debug, Clone, Default)]
pub struct MetadataOpts {
    pub pass_by: PassBy,
    pub reference_uri: Option<Url>,
    pub metadata: RpRegistrationMetadataPayload,
}

/// RP metadata, in the shape of the dialect it is sent for.
#[derive(Debug, Clone)]
pub enum ClientMetadataOpts {
    /// `registration` / `registration_uri`.
    Registration(MetadataOpts),
    /// `client_metadata` / `client_metadata_uri`.
    ClientMetadata(MetadataOpts),
}

impl ClientMetadataOpts {
    pub fn metadata_opts(&self) -> &MetadataOpts {
        match self {
            ClientMetadataOpts::Registration(m) | ClientMetadataOpts::ClientMetadata(m) => m,
        }
    }

    /// The by-value and by-reference parameter names.
    pub fn keys(&self) -> (&'static str, &'static str) {
        match self {
            ClientMetadataOpts::Registration(_) => ("registration", "registration_uri"),
            ClientMetadataOpts::ClientMetadata(_) => ("client_metadata", "client_metadata_uri"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateAuthorizationRequestOpts {
    /// Defaults to `openid`.
    pub scheme: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<Url>,
    /// Defaults to `id_token`.
    pub response_type: Option<ResponseType>,
    pub response_mode: Option<String>,
    pub scope: Option<String>,
    /// Generated when absent.
    pub nonce: Option<String>,
    /// Generated when absent.
    pub state: Option<String>,
    pub claims: Option<Json>,
    /// Top level `presentation_definition`, a definition or a list of them.
    pub presentation_definition: Option<Json>,
    pub request_object: Option<RequestObjectOpts>,
    pub client_metadata: Option<ClientMetadataOpts>,
    /// Lifetime of the request object in seconds.
    pub expires_in: Option<u64>,
}

impl CreateAuthorizationRequestOpts {
    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME)
    }

    /// Fill in everything that has a default, so that the request object and the outer
    /// payload agree on generated values.
    pub(crate) fn with_defaults(mut self) -> Self {
        self.response_type.get_or_insert_with(ResponseType::default);
        self.scope = Some(Scope::openid(self.scope.as_deref()).0);
        self.nonce.get_or_insert_with(gen_nonce);
        self.state.get_or_insert_with(gen_state);
        self.expires_in.get_or_insert(DEFAULT_EXPIRES_IN);
        self
    }

    pub(crate) fn pass_by(&self) -> PassBy {
        self.request_object
            .as_ref()
            .map(|ro| ro.pass_by)
            .unwrap_or_default()
    }

    pub(crate) fn signature(&self) -> Option<&SignatureType> {
        self.request_object.as_ref()?.signature.as_ref()
    }
}

/// Check options before anything gets signed or fetched.
pub fn assert_valid_authorization_request_opts(opts: &CreateAuthorizationRequestOpts) -> Result<()> {
    let Some(request_object) = &opts.request_object else {
        return Err(Error::BadParams("request object options are required".into()));
    };
    if opts.client_id.as_deref().map_or(true, str::is_empty) {
        return Err(Error::BadParams("a client id is required".into()));
    }
    if opts.redirect_uri.is_none() {
        return Err(Error::BadParams("a redirect uri is required".into()));
    }
    if request_object.pass_by == PassBy::Reference && request_object.reference_uri.is_none() {
        return Err(Error::BadParams(
            "a request object passed by reference requires a reference uri".into(),
        ));
    }
    if request_object.pass_by != PassBy::None && request_object.signature.is_none() {
        return Err(Error::BadSignatureParams(
            "a request object that is passed along must be signed".into(),
        ));
    }
    if let Some(metadata) = &opts.client_metadata {
        let m = metadata.metadata_opts();
        if m.pass_by == PassBy::Reference && m.reference_uri.is_none() {
            return Err(Error::BadParams(
                "metadata passed by reference requires a reference uri".into(),
            ));
        }
    }
    if let Some(definition) = opts
        .claims
        .as_ref()
        .and_then(|c| c.pointer("/vp_token/presentation_definition"))
    {
        let definitions = match definition {
            Json::Array(items) => items.clone(),
            single => vec![single.clone()],
        };
        for definition in definitions {
            PresentationDefinition::try_from(definition).validation()?;
        }
    }
    Ok(())
}

/// Capabilities and policies used to verify a received request.
#[derive(Clone)]
pub struct VerifyAuthorizationRequestOpts {
    pub resolver: Arc<dyn DidResolver>,
    pub http_client: Arc<dyn AsyncHttpClient>,
    /// When set, the request must carry this nonce.
    pub nonce: Option<String>,
    /// Empty accepts every dialect.
    pub supported_versions: Vec<SupportedVersion>,
    pub check_linked_domain: CheckLinkedDomain,
    pub domain_linkage_verifier: Option<Arc<dyn DomainLinkageVerifier>>,
}

impl fmt::Debug for VerifyAuthorizationRequestOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyAuthorizationRequestOpts")
            .field("nonce", &self.nonce)
            .field("supported_versions", &self.supported_versions)
            .field("check_linked_domain", &self.check_linked_domain)
            .finish_non_exhaustive()
    }
}

impl VerifyAuthorizationRequestOpts {
    pub fn new(resolver: Arc<dyn DidResolver>, http_client: Arc<dyn AsyncHttpClient>) -> Self {
        Self {
            resolver,
            http_client,
            nonce: None,
            supported_versions: vec![],
            check_linked_domain: CheckLinkedDomain::default(),
            domain_linkage_verifier: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<SupportedVersion>) -> Self {
        self.supported_versions = versions;
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

    pub fn assert_valid(&self) -> Result<()> {
        if self.check_linked_domain == CheckLinkedDomain::Always
            && self.domain_linkage_verifier.is_none()
        {
            return Err(Error::BadParams(
                "always checking linked domains requires a domain linkage verifier".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::core::signer::InternalSignature;

    fn opts() -> CreateAuthorizationRequestOpts {
        CreateAuthorizationRequestOpts {
            client_id: Some("test_client_id".into()),
            redirect_uri: Some("https://acme.com/hello".parse().unwrap()),
            request_object: Some(RequestObjectOpts {
                pass_by: PassBy::Value,
                reference_uri: None,
                signature: Some(SignatureType::Internal(InternalSignature {
                    hex_private_key: "f857544a9d1097e242ff0b287a7e6e90f19cf973efe2317f2a4678739664420f"
                        .into(),
                    did: "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0".into(),
                    kid: "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0#keys-1".into(),
                    alg: None,
                })),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn valid() {
        assert_valid_authorization_request_opts(&opts()).unwrap();
    }

    #[test]
    fn missing_pieces() {
        let mut o = opts();
        o.request_object = None;
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::BadParams(_))
        ));

        let mut o = opts();
        o.redirect_uri = None;
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::BadParams(_))
        ));

        let mut o = opts();
        if let Some(ro) = o.request_object.as_mut() {
            ro.pass_by = PassBy::Reference;
        }
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::BadParams(_))
        ));

        let mut o = opts();
        if let Some(ro) = o.request_object.as_mut() {
            ro.signature = None;
        }
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::BadSignatureParams(_))
        ));

        let mut o = opts();
        o.client_metadata = Some(ClientMetadataOpts::Registration(MetadataOpts {
            pass_by: PassBy::Reference,
            ..Default::default()
        }));
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::BadParams(_))
        ));
    }

    #[test]
    fn invalid_claims_definition() {
        let mut o = opts();
        o.claims = Some(json!({
            "vp_token": { "presentation_definition": { "id": "pd", "input_descriptors": [] } }
        }));
        assert!(matches!(
            assert_valid_authorization_request_opts(&o),
            Err(Error::ValidationFailure(_))
        ));
    }

    #[test]
    fn defaults() {
        let o = opts().with_defaults();
        assert_eq!(o.response_type, Some(ResponseType::IdToken));
        assert_eq!(o.scope.as_deref(), Some("openid"));
        assert!(o.nonce.is_some() && o.state.is_some());
        assert_eq!(o.scheme(), "openid");
    }
}
