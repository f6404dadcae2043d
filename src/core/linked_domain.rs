//! Well-known DID configuration (domain linkage) checks for request signers.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};
use url::Url;

use crate::core::did::{self, DidResolver, Service};
use crate::core::jwt;
use crate::core::util::{get_json, AsyncHttpClient};
use crate::error::{self, Error, ErrorKind};

pub const LINKED_DOMAINS_SERVICE: &str = "LinkedDomains";
pub const DID_CONFIGURATION_PATH: &str = ".well-known/did-configuration.json";

/// When to require a verified domain linkage for the signer of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLinkedDomain {
    Never,
    /// Only when the DID document advertises a `LinkedDomains` service.
    #[default]
    IfPresent,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialVerification {
    pub verified: bool,
}

/// Verifies domain linkage credentials found in a DID configuration resource.
#[async_trait]
pub trait DomainLinkageVerifier: Send + Sync {
    async fn verify_credential(&self, credential: &Json) -> Result<CredentialVerification>;
}

/// Check that `did` is linked to one of the origins its document advertises.
pub async fn validate_linked_domain_with_did(
    did: &str,
    policy: CheckLinkedDomain,
    verifier: Option<&Arc<dyn DomainLinkageVerifier>>,
    resolver: &dyn DidResolver,
    http_client: &dyn AsyncHttpClient,
) -> error::Result<()> {
    if policy == CheckLinkedDomain::Never {
        return Ok(());
    }

    let document = resolver
        .resolve(did)
        .await
        .context(format!("failed to resolve '{did}'"))
        .linked_domain()?;

    let origins: Vec<String> = did::services(&document)
        .iter()
        .filter(|s| s.has_type(LINKED_DOMAINS_SERVICE))
        .flat_map(Service::endpoints)
        .collect();

    if origins.is_empty() {
        return match policy {
            CheckLinkedDomain::Always => Err(Error::LinkedDomainFailure(format!(
                "'{did}' does not advertise a {LINKED_DOMAINS_SERVICE} service"
            ))),
            _ => {
                debug!("{did} has no linked domains, skipping the check");
                Ok(())
            }
        };
    }

    let verifier = verifier.ok_or_else(|| {
        Error::LinkedDomainFailure("no domain linkage verifier configured".into())
    })?;

    let mut failures = vec![];
    for origin in origins {
        match validate_origin(did, &origin, verifier.as_ref(), http_client).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("domain linkage of {did} with {origin} failed: {e:#}");
                failures.push(format!("{origin}: {e:#}"));
            }
        }
    }

    Err(Error::LinkedDomainFailure(failures.join("; ")))
}

async fn validate_origin(
    did: &str,
    origin: &str,
    verifier: &dyn DomainLinkageVerifier,
    http_client: &dyn AsyncHttpClient,
) -> Result<()> {
    let origin = Url::parse(origin).context("invalid origin")?;
    let configuration_url = origin
        .join(&format!("/{DID_CONFIGURATION_PATH}"))
        .context("invalid configuration url")?;

    let configuration = get_json(http_client, &configuration_url).await?;
    let linked_dids = configuration
        .get("linked_dids")
        .and_then(Json::as_array)
        .context("configuration has no 'linked_dids'")?;

    for credential in linked_dids {
        if !links(credential, did, &origin) {
            continue;
        }
        if verifier.verify_credential(credential).await?.verified {
            return Ok(());
        }
    }

    anyhow::bail!("no verified domain linkage credential for '{did}'")
}

/// Whether a domain linkage credential (JWT or JSON-LD) names `did` and `origin`.
fn links(credential: &Json, did: &str, origin: &Url) -> bool {
    let subject = match credential {
        Json::String(jwt) => jwt::decode(jwt).ok().and_then(|decoded| {
            decoded
                .payload
                .get_raw("vc")
                .and_then(|vc| vc.get("credentialSubject"))
                .cloned()
        }),
        Json::Object(_) => credential.get("credentialSubject").cloned(),
        _ => None,
    };
    let Some(subject) = subject else {
        return false;
    };
    let same_origin = subject
        .get("origin")
        .and_then(Json::as_str)
        .and_then(|o| Url::parse(o).ok())
        .map(|o| o.origin() == origin.origin())
        .unwrap_or(false);
    subject.get("id").and_then(Json::as_str) == Some(did) && same_origin
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::core::did::test::StaticResolver;
    use crate::core::did::Document;
    use crate::core::util::test_utils::MockHttpClient;

    const DID: &str = "did:example:linked";

    struct Accepting(bool);

    #[async_trait]
    impl DomainLinkageVerifier for Accepting {
        async fn verify_credential(&self, _: &Json) -> Result<CredentialVerification> {
            Ok(CredentialVerification { verified: self.0 })
        }
    }

    fn document(with_service: bool) -> Document {
        let service = if with_service {
            json!([{
                "id": format!("{DID}#linked"),
                "type": "LinkedDomains",
                "serviceEndpoint": { "origins": ["https://rp.example/"] }
            }])
        } else {
            json!([])
        };
        serde_json::from_value(json!({ "id": DID, "service": service })).unwrap()
    }

    fn configuration() -> Json {
        json!({
            "@context": "https://identity.foundation/.well-known/did-configuration/v1",
            "linked_dids": [{
                "credentialSubject": { "id": DID, "origin": "https://rp.example" }
            }]
        })
    }

    #[tokio::test]
    async fn always_requires_a_service() {
        let resolver = StaticResolver::default().with(document(false));
        let err = validate_linked_domain_with_did(
            DID,
            CheckLinkedDomain::Always,
            None,
            &resolver,
            &MockHttpClient::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LinkedDomainFailure(_)));
    }

    #[tokio::test]
    async fn if_present_without_service() {
        let resolver = StaticResolver::default().with(document(false));
        validate_linked_domain_with_did(
            DID,
            CheckLinkedDomain::IfPresent,
            None,
            &resolver,
            &MockHttpClient::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn if_present_with_unreachable_configuration() {
        let resolver = StaticResolver::default().with(document(true));
        let verifier: Arc<dyn DomainLinkageVerifier> = Arc::new(Accepting(true));
        let err = validate_linked_domain_with_did(
            DID,
            CheckLinkedDomain::IfPresent,
            Some(&verifier),
            &resolver,
            &MockHttpClient::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LinkedDomainFailure(_)));
    }

    #[tokio::test]
    async fn verified_linkage() {
        let resolver = StaticResolver::default().with(document(true));
        let client = MockHttpClient::default().with_json(
            "https://rp.example/.well-known/did-configuration.json",
            configuration(),
        );

        let verifier: Arc<dyn DomainLinkageVerifier> = Arc::new(Accepting(true));
        validate_linked_domain_with_did(
            DID,
            CheckLinkedDomain::Always,
            Some(&verifier),
            &resolver,
            &client,
        )
        .await
        .unwrap();

        let rejecting: Arc<dyn DomainLinkageVerifier> = Arc::new(Accepting(false));
        assert!(validate_linked_domain_with_did(
            DID,
            CheckLinkedDomain::Always,
            Some(&rejecting),
            &resolver,
            &client,
        )
        .await
        .is_err());
    }
}
