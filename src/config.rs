use serde::Deserialize;
use serde_json::Value as Json;
use url::Url;

use crate::core::authorization_request::opts::PassBy;
use crate::core::linked_domain::CheckLinkedDomain;
use crate::core::metadata::RpRegistrationMetadataPayload;
use crate::core::version::SupportedVersion;

/// Static settings of a relying party, e.g. read from a configuration file.
///
/// Signers, resolvers and callbacks are not configuration; they are added on the builder.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RpConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub response_mode: Option<String>,
    #[serde(default)]
    pub request_object: RequestObjectConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub claims: Option<Json>,
    #[serde(default = "all_versions")]
    pub supported_versions: Vec<SupportedVersion>,
    #[serde(default)]
    pub check_linked_domain: CheckLinkedDomain,
    /// Loose signature shape, see [SignatureType](crate::core::signer::SignatureType).
    #[serde(default)]
    pub signature: Option<Json>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestObjectConfig {
    #[serde(default)]
    pub pass_by: PassBy,
    /// A fixed URL the request object is served from.
    #[serde(default)]
    pub reference_uri: Option<Url>,
    /// Serve each request object under its own path, `<base><state>`.
    #[serde(default)]
    pub reference_base: Option<BaseUrl>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub pass_by: PassBy,
    #[serde(default)]
    pub reference_uri: Option<Url>,
    /// Send the metadata as `client_metadata` rather than `registration`.
    #[serde(default)]
    pub as_client_metadata: bool,
    #[serde(default)]
    pub metadata: RpRegistrationMetadataPayload,
}

/// Static settings of a self-issued OpenID provider.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct OpConfig {
    pub did: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// OP metadata sent along with the id token.
    #[serde(default)]
    pub registration: Option<Json>,
    #[serde(default = "all_versions")]
    pub supported_versions: Vec<SupportedVersion>,
    #[serde(default)]
    pub check_linked_domain: CheckLinkedDomain,
    #[serde(default)]
    pub signature: Option<Json>,
}

fn all_versions() -> Vec<SupportedVersion> {
    SupportedVersion::ALL.to_vec()
}

/// A url that is always a base (can be safely join()'ed with further path elements without
/// mangling).
#[derive(Deserialize, Debug, Clone, Hash, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct BaseUrl(Url);

impl std::ops::Deref for BaseUrl {
    type Target = Url;

    fn deref(&self) -> &Url {
        &self.0
    }
}

impl TryFrom<String> for BaseUrl {
    type Error = url::ParseError;

    fn try_from(mut url: String) -> Result<Self, Self::Error> {
        // Make URL a base.
        if !url.ends_with('/') {
            url += "/"
        }
        url.parse().map(Self)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn rp_config() {
        let config: RpConfig = serde_path_to_error::deserialize(json!({
            "client_id": "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0",
            "redirect_uri": "https://acme.com/hello",
            "request_object": {
                "pass_by": "reference",
                "reference_base": "https://rp.acme.com/siop"
            },
            "registration": {
                "pass_by": "value",
                "metadata": { "subject_syntax_types_supported": ["did:ethr:"] }
            },
            "signature": { "hexPrivateKey": "f857", "did": "did:ethr:0x01", "kid": "did:ethr:0x01#key-1" }
        }))
        .unwrap();

        assert_eq!(config.request_object.pass_by, PassBy::Reference);
        let base = config.request_object.reference_base.unwrap();
        assert_eq!(base.join("abc").unwrap().as_str(), "https://rp.acme.com/siop/abc");
        assert_eq!(config.supported_versions, SupportedVersion::ALL.to_vec());
        assert_eq!(config.check_linked_domain, CheckLinkedDomain::IfPresent);
    }

    #[test]
    fn op_config() {
        let config: OpConfig = serde_path_to_error::deserialize(json!({
            "did": "did:example:op",
            "supported_versions": ["SIOPv2_D11"],
            "check_linked_domain": "never"
        }))
        .unwrap();
        assert_eq!(config.supported_versions, vec![SupportedVersion::SiopV2D11]);
        assert_eq!(config.check_linked_domain, CheckLinkedDomain::Never);
    }
}
