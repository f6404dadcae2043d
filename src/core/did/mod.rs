use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;
use ssi::jwk::JWK;
use tracing::debug;

use crate::core::jwt::{self, DecodedJwt, SigningAlgo};
use crate::error::{self, Error, ErrorKind};

pub use ssi::dids::Document;

/// A service entry of a DID document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    /// A string or a list of strings.
    #[serde(rename = "type")]
    pub type_: Json,
    /// A URL, a list of URLs or a map such as `{"origins": [...]}`.
    #[serde(default)]
    pub service_endpoint: Json,
}

impl Service {
    pub fn has_type(&self, name: &str) -> bool {
        match &self.type_ {
            Json::String(s) => s == name,
            Json::Array(types) => types.iter().any(|t| t.as_str() == Some(name)),
            _ => false,
        }
    }

    /// Every URL in the service endpoint.
    pub fn endpoints(&self) -> Vec<String> {
        fn collect(value: &Json, out: &mut Vec<String>) {
            match value {
                Json::String(s) => out.push(s.clone()),
                Json::Array(items) => items.iter().for_each(|i| collect(i, out)),
                Json::Object(map) => map.values().for_each(|v| collect(v, out)),
                _ => {}
            }
        }
        let mut out = vec![];
        collect(&self.service_endpoint, &mut out);
        out
    }
}

/// The services of a document. Entries that do not parse are skipped.
pub fn services(document: &Document) -> Vec<Service> {
    serde_json::to_value(document)
        .ok()
        .and_then(|doc| doc.get("service").and_then(Json::as_array).cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| serde_json::from_value(s).ok())
        .collect()
}

/// The public key of the verification method `kid`, listed under `verificationMethod` or
/// embedded in `authentication` or `assertionMethod`.
///
/// `publicKeyJwk` is used as is. `publicKeyHex` is read as a key for `alg`.
pub fn public_jwk(document: &Document, kid: &str, alg: SigningAlgo) -> Result<JWK> {
    let document = serde_json::to_value(document).context("failed to read DID document")?;
    let method = ["verificationMethod", "authentication", "assertionMethod"]
        .iter()
        .filter_map(|relation| document.get(*relation).and_then(Json::as_array))
        .flatten()
        .find(|m| {
            m.get("id")
                .and_then(Json::as_str)
                .is_some_and(|id| matches_id(id, kid))
        })
        .with_context(|| format!("'{kid}' is not a verification method of the document"))?;

    if let Some(jwk) = method.get("publicKeyJwk") {
        return serde_json::from_value(jwk.clone()).context("invalid 'publicKeyJwk'");
    }
    if let Some(hex) = method.get("publicKeyHex").and_then(Json::as_str) {
        return jwt::public_jwk_from_hex(alg, hex);
    }
    bail!("'{kid}' has no usable public key")
}

fn matches_id(id: &str, kid: &str) -> bool {
    if id == kid {
        return true;
    }
    match (id.strip_prefix('#'), kid.split_once('#')) {
        (Some(fragment), Some((_, kid_fragment))) => fragment == kid_fragment,
        _ => false,
    }
}

/// Resolves DIDs to their documents.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<Document>;
}

/// The method name of a DID, e.g. `ethr` for `did:ethr:0x...`.
pub fn did_method(did: &str) -> Option<&str> {
    let mut parts = did.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("did"), Some(method), Some(_)) if !method.is_empty() => Some(method),
        _ => None,
    }
}

/// An immutable mapping from DID method to resolver, built once.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    methods: BTreeMap<String, Arc<dyn DidResolver>>,
    fallback: Option<Arc<dyn DidResolver>>,
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a registry that also resolves `did:<method>:` with `resolver`.
    pub fn with_method(mut self, method: impl Into<String>, resolver: Arc<dyn DidResolver>) -> Self {
        self.methods.insert(method.into(), resolver);
        self
    }

    /// Returns a registry that uses `resolver` for methods without a dedicated resolver.
    pub fn with_default(mut self, resolver: Arc<dyn DidResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }

    pub fn resolve_method(&self, method: &str) -> Option<Arc<dyn DidResolver>> {
        self.methods
            .get(method)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// The methods with a dedicated resolver, e.g. `["ethr", "key"]`.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// `did:<method>:` for each registered method, as advertised in `subject_syntax_types_supported`.
    pub fn subject_syntax_types(&self) -> Vec<String> {
        self.methods().map(|m| format!("did:{m}:")).collect()
    }
}

#[async_trait]
impl DidResolver for ResolverRegistry {
    async fn resolve(&self, did: &str) -> Result<Document> {
        let method = did_method(did).context(format!("'{did}' is not a DID"))?;
        let Some(resolver) = self.resolve_method(method) else {
            bail!("no resolver registered for DID method '{method}'")
        };
        resolver.resolve(did).await
    }
}

/// The outcome of verifying a DID signed JWT.
#[derive(Debug, Clone)]
pub struct VerifiedJwt {
    pub jwt: String,
    pub decoded: DecodedJwt,
    pub issuer: String,
    /// The absolute id of the verification method that signed.
    pub kid: String,
    pub jwk: JWK,
    pub did_document: Document,
}

/// Verify a compact JWT signed with a key from its issuer's DID document.
///
/// The key is located through the header `kid`. Expired tokens are rejected.
pub async fn verify_did_jwt(
    jwt: &str,
    resolver: &dyn DidResolver,
    audience: Option<&str>,
) -> error::Result<VerifiedJwt> {
    let decoded = jwt::decode(jwt).signature()?;
    let alg = decoded.header.algorithm().signature()?;

    let did = decoded
        .signer_did()
        .ok_or_else(|| Error::SignatureVerificationFailure("no signer DID in the JWT".into()))?;
    let kid = decoded
        .header
        .kid
        .clone()
        .ok_or_else(|| Error::SignatureVerificationFailure("JWT header has no 'kid'".into()))?;
    let kid = if kid.starts_with('#') {
        format!("{did}{kid}")
    } else {
        kid
    };

    debug!("resolving {did} to verify a JWT signed by {kid}");
    let did_document = resolver
        .resolve(&did)
        .await
        .context(format!("failed to resolve '{did}'"))
        .signature()?;

    let jwk = public_jwk(&did_document, &kid, alg).signature()?;
    jwt::verify(jwt, &jwk).signature()?;

    if let Some(exp) = decoded.payload.get_raw("exp").and_then(Json::as_u64) {
        if exp < crate::utils::now() {
            return Err(Error::SignatureVerificationFailure("JWT has expired".into()));
        }
    }

    if let Some(audience) = audience {
        let matches = match decoded.payload.get_raw("aud") {
            None => true,
            Some(Json::String(aud)) => aud == audience,
            Some(Json::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(audience)),
            Some(_) => false,
        };
        if !matches {
            return Err(Error::SignatureVerificationFailure(format!(
                "JWT audience does not include '{audience}'"
            )));
        }
    }

    Ok(VerifiedJwt {
        jwt: jwt.to_string(),
        decoded,
        issuer: did,
        kid,
        jwk,
        did_document,
    })
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::core::signer::{P256Signer, RequestSigner, SignatureType, SuppliedSignature};
    use crate::core::util::test_utils::MockHttpClient;

    /// Serves fixed documents by DID.
    #[derive(Default)]
    pub(crate) struct StaticResolver(pub HashMap<String, Document>);

    impl StaticResolver {
        pub fn with(mut self, document: Document) -> Self {
            self.0.insert(document.id.to_string(), document);
            self
        }
    }

    #[async_trait]
    impl DidResolver for StaticResolver {
        async fn resolve(&self, did: &str) -> Result<Document> {
            self.0.get(did).cloned().context("not found")
        }
    }

    /// A document with a single `JsonWebKey2020` method, `<did>#key-1`, and the given services.
    pub(crate) fn document_with_services(did: &str, jwk: &JWK, service: Json) -> Document {
        serde_json::from_value(json!({
            "id": did,
            "verificationMethod": [{
                "id": format!("{did}#key-1"),
                "type": "JsonWebKey2020",
                "controller": did,
                "publicKeyJwk": jwk.to_public(),
            }],
            "authentication": [format!("{did}#key-1")],
            "service": service,
        }))
        .unwrap()
    }

    pub(crate) fn document_for(did: &str, jwk: &JWK) -> Document {
        document_with_services(did, jwk, json!([]))
    }

    #[test]
    fn methods() {
        assert_eq!(did_method("did:ethr:0xabc"), Some("ethr"));
        assert_eq!(did_method("did:key"), None);
        assert_eq!(did_method("https://example.com"), None);
    }

    #[tokio::test]
    async fn registry_dispatch() {
        let registry = ResolverRegistry::new().with_method(
            "example",
            Arc::new(
                StaticResolver::default()
                    .with(serde_json::from_value(json!({ "id": "did:example:1" })).unwrap()),
            ),
        );
        assert!(registry.resolve("did:example:1").await.is_ok());
        assert!(registry.resolve("did:other:1").await.is_err());
        assert_eq!(registry.subject_syntax_types(), vec!["did:example:"]);
    }

    #[tokio::test]
    async fn verify_signed_jwt() {
        let did = "did:example:rp";
        let signer = Arc::new(P256Signer::from_hex(&"11".repeat(32)).unwrap());
        let resolver = StaticResolver::default().with(document_for(did, signer.jwk()));
        let signature = SignatureType::Supplied(SuppliedSignature {
            signer,
            did: did.into(),
            kid: format!("{did}#key-1"),
        });

        let payload = json!({ "iss": did, "aud": "https://op.example" });
        let jwt = signature
            .sign_jwt(payload.as_object().unwrap(), &MockHttpClient::default())
            .await
            .unwrap();

        let verified = verify_did_jwt(&jwt, &resolver, Some("https://op.example"))
            .await
            .unwrap();
        assert_eq!(verified.issuer, did);
        assert_eq!(verified.kid, format!("{did}#key-1"));

        let err = verify_did_jwt(&jwt, &resolver, Some("https://other.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignatureVerificationFailure(_)));

        let mut tampered = jwt.clone();
        tampered.pop();
        tampered.push(if jwt.ends_with('A') { 'B' } else { 'A' });
        assert!(verify_did_jwt(&tampered, &resolver, None).await.is_err());
    }

    #[tokio::test]
    async fn hex_verification_method() {
        let did = "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0";
        let key = "f857544a9d1097e242ff0b287a7e6e90f19cf973efe2317f2a4678739664420f";
        let public = k256::SecretKey::from_slice(&hex::decode(key).unwrap())
            .unwrap()
            .public_key()
            .to_sec1_bytes();
        let document: Document = serde_json::from_value(json!({
            "id": did,
            "verificationMethod": [{
                "id": format!("{did}#controller"),
                "type": "EcdsaSecp256k1VerificationKey2019",
                "controller": did,
                "publicKeyHex": hex::encode(public),
            }],
        }))
        .unwrap();
        let resolver = StaticResolver::default().with(document);

        let signature = SignatureType::try_from(json!({
            "hexPrivateKey": key,
            "did": did,
            "kid": "#controller",
        }))
        .unwrap();
        let jwt = signature
            .sign_jwt(json!({ "iss": did }).as_object().unwrap(), &MockHttpClient::default())
            .await
            .unwrap();

        let verified = verify_did_jwt(&jwt, &resolver, None).await.unwrap();
        assert_eq!(verified.kid, format!("{did}#controller"));
    }
}
