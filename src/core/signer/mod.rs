use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};
use tracing::debug;
use url::Url;

use base64::prelude::*;
use ssi::jwk::JWK;

use crate::core::jwt::{self, JwtHeader, SigningAlgo};
use crate::core::util::{post_with_bearer_token, AsyncHttpClient};
use crate::error::{Error, ErrorKind};

#[async_trait]
pub trait RequestSigner: fmt::Debug + Send + Sync {
    /// The algorithm that will be used to sign.
    fn alg(&self) -> SigningAlgo;
    /// The public JWK of the signer.
    fn jwk(&self) -> &JWK;
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

pub struct P256Signer {
    key: p256::ecdsa::SigningKey,
    jwk: JWK,
}

impl P256Signer {
    pub fn new(key: p256::ecdsa::SigningKey) -> Result<Self> {
        let pk: p256::PublicKey = key.verifying_key().into();
        let jwk = serde_json::from_str(&pk.to_jwk_string())?;
        Ok(Self { key, jwk })
    }

    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim_start_matches("0x")).context("private key is not hex")?;
        Self::new(p256::ecdsa::SigningKey::from_slice(&bytes).context("invalid P-256 private key")?)
    }
}

impl fmt::Debug for P256Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P256Signer")
            .field("jwk", &self.jwk)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestSigner for P256Signer {
    fn alg(&self) -> SigningAlgo {
        SigningAlgo::ES256
    }

    fn jwk(&self) -> &JWK {
        &self.jwk
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::{signature::Signer, Signature};
        let sig: Signature = self.key.sign(payload);
        Ok(sig.to_bytes().to_vec())
    }
}

pub struct K256Signer {
    key: k256::ecdsa::SigningKey,
    jwk: JWK,
}

impl K256Signer {
    pub fn new(key: k256::ecdsa::SigningKey) -> Result<Self> {
        let pk: k256::PublicKey = key.verifying_key().into();
        let jwk = serde_json::from_str(&pk.to_jwk_string())?;
        Ok(Self { key, jwk })
    }

    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim_start_matches("0x")).context("private key is not hex")?;
        Self::new(
            k256::ecdsa::SigningKey::from_slice(&bytes).context("invalid secp256k1 private key")?,
        )
    }
}

impl fmt::Debug for K256Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K256Signer")
            .field("jwk", &self.jwk)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestSigner for K256Signer {
    fn alg(&self) -> SigningAlgo {
        SigningAlgo::ES256K
    }

    fn jwk(&self) -> &JWK {
        &self.jwk
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        use k256::ecdsa::{signature::Signer, Signature};
        let sig: Signature = self.key.sign(payload);
        Ok(sig.to_bytes().to_vec())
    }
}

/// Key material held by the caller, used to sign in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalSignature {
    pub hex_private_key: String,
    pub did: String,
    pub kid: String,
    /// Derived from the DID method and key length when absent.
    pub alg: Option<SigningAlgo>,
}

/// A remote signing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSignature {
    pub signature_uri: Url,
    pub did: String,
    pub kid: String,
    pub authorization_token: String,
    pub alg: SigningAlgo,
}

/// A signer provided by the caller.
#[derive(Debug, Clone)]
pub struct SuppliedSignature {
    pub signer: Arc<dyn RequestSigner>,
    pub did: String,
    pub kid: String,
}

/// How request objects and id tokens get signed.
#[derive(Debug, Clone)]
pub enum SignatureType {
    Internal(InternalSignature),
    External(ExternalSignature),
    Supplied(SuppliedSignature),
}

impl SignatureType {
    pub fn did(&self) -> &str {
        match self {
            SignatureType::Internal(s) => &s.did,
            SignatureType::External(s) => &s.did,
            SignatureType::Supplied(s) => &s.did,
        }
    }

    pub fn kid(&self) -> &str {
        match self {
            SignatureType::Internal(s) => &s.kid,
            SignatureType::External(s) => &s.kid,
            SignatureType::Supplied(s) => &s.kid,
        }
    }

    fn assert_valid(&self) -> crate::error::Result<()> {
        let (did, kid) = (self.did(), self.kid());
        if did.is_empty() || kid.is_empty() {
            return Err(Error::BadSignatureParams(
                "a signer requires a DID and a key id".into(),
            ));
        }
        match self {
            SignatureType::Internal(s) if s.hex_private_key.is_empty() => Err(
                Error::BadSignatureParams("internal signature requires a private key".into()),
            ),
            SignatureType::External(s) if s.signature_uri.scheme() != "https" => {
                Err(Error::BadSignatureParams(format!(
                    "signature endpoint '{}' must use https",
                    s.signature_uri
                )))
            }
            SignatureType::External(s) if s.authorization_token.is_empty() => Err(
                Error::BadSignatureParams("external signature requires a bearer token".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Sign `payload` as a compact JWT.
    pub async fn sign_jwt(
        &self,
        payload: &Map<String, Json>,
        http_client: &dyn AsyncHttpClient,
    ) -> crate::error::Result<String> {
        self.assert_valid()?;
        match self {
            SignatureType::Internal(internal) => {
                let jwk = internal_jwk(internal).bad_signature_params()?;
                jwt::sign(payload, &jwk).await.bad_signature_params()
            }
            SignatureType::Supplied(supplied) => {
                make_jwt(supplied.signer.as_ref(), &supplied.kid, payload).await
            }
            SignatureType::External(external) => {
                debug!("requesting signature from {}", external.signature_uri);
                let body = json!({
                    "issuer": external.did,
                    "kid": external.kid,
                    "alg": external.alg,
                    "payload": payload,
                });
                let response = post_with_bearer_token(
                    http_client,
                    &external.signature_uri,
                    &body,
                    &external.authorization_token,
                )
                .await?;
                match response.get("jws").and_then(Json::as_str) {
                    Some(jws) if jwt::is_compact_jwt(jws) => Ok(jws.to_string()),
                    _ => Err(Error::ExternalFetchFailure(format!(
                        "'{}' did not return a compact JWS",
                        external.signature_uri
                    ))),
                }
            }
        }
    }
}

/// The private key of an internal signature, with `kid` and `alg` set.
fn internal_jwk(internal: &InternalSignature) -> Result<JWK> {
    let key = internal.hex_private_key.trim_start_matches("0x");
    let alg = match internal.alg {
        Some(alg) => alg,
        None if key.len() == 128 => SigningAlgo::EdDSA,
        None if internal.did.starts_with("did:ethr:") => SigningAlgo::ES256K,
        None if internal.did.starts_with("did:key:z6Mk") => SigningAlgo::EdDSA,
        None => SigningAlgo::ES256,
    };
    let mut jwk = jwt::private_jwk_from_hex(alg, key)?;
    jwk.key_id = Some(internal.kid.clone());
    jwk.algorithm = Some(alg.into());
    Ok(jwk)
}

/// Assemble a compact JWS around a signature from `signer`.
async fn make_jwt(
    signer: &dyn RequestSigner,
    kid: &str,
    payload: &Map<String, Json>,
) -> crate::error::Result<String> {
    let header = JwtHeader::new(signer.alg(), kid);
    let header_b64 = serde_json::to_vec(&header)
        .map(|b| BASE64_URL_SAFE_NO_PAD.encode(b))
        .context("failed to encode header")
        .bad_signature_params()?;
    let body_b64 = serde_json::to_vec(payload)
        .map(|b| BASE64_URL_SAFE_NO_PAD.encode(b))
        .context("failed to encode payload")
        .bad_signature_params()?;
    let signature = signer
        .sign(format!("{header_b64}.{body_b64}").as_bytes())
        .await
        .context("signer failed")
        .bad_signature_params()?;
    let sig_b64 = BASE64_URL_SAFE_NO_PAD.encode(signature);
    Ok(format!("{header_b64}.{body_b64}.{sig_b64}"))
}

impl TryFrom<Json> for SignatureType {
    type Error = Error;

    /// Resolve a loosely shaped signature configuration.
    ///
    /// `hexPrivateKey` selects internal signing and `signatureUri` external signing. Supplied
    /// signers cannot be described in JSON.
    fn try_from(value: Json) -> Result<Self, Error> {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| value.get(*n).and_then(Json::as_str))
                .map(str::to_string)
        };
        let alg = field(&["alg"])
            .map(|a| a.parse::<SigningAlgo>())
            .transpose()
            .bad_signature_params()?;
        let did = field(&["did"]).unwrap_or_default();
        let kid = field(&["kid"]).unwrap_or_default();

        if let Some(hex_private_key) = field(&["hexPrivateKey", "hex_private_key"]) {
            return Ok(SignatureType::Internal(InternalSignature {
                hex_private_key,
                did,
                kid,
                alg,
            }));
        }

        if let Some(signature_uri) = field(&["signatureUri", "signature_uri"]) {
            let signature_uri = Url::parse(&signature_uri)
                .context("invalid signature endpoint")
                .bad_signature_params()?;
            return Ok(SignatureType::External(ExternalSignature {
                signature_uri,
                did,
                kid,
                authorization_token: field(&["authZToken", "authorization_token"])
                    .unwrap_or_default(),
                alg: alg.unwrap_or(SigningAlgo::ES256K),
            }));
        }

        Err(Error::BadSignatureParams(
            "signature type is neither internal nor external".into(),
        ))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::core::util::test_utils::MockHttpClient;

    const HEX_KEY: &str = "f857544a9d1097e242ff0b287a7e6e90f19cf973efe2317f2a4678739664420f";
    const DID: &str = "did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0";

    #[test]
    fn empty_shape_is_rejected() {
        assert!(matches!(
            SignatureType::try_from(json!({})),
            Err(Error::BadSignatureParams(_))
        ));
    }

    #[tokio::test]
    async fn internal_ethr_signs_es256k() {
        let signature = SignatureType::try_from(json!({
            "hexPrivateKey": HEX_KEY,
            "did": DID,
            "kid": format!("{DID}#keys-1"),
        }))
        .unwrap();

        let jwt = signature
            .sign_jwt(json!({ "a": 1 }).as_object().unwrap(), &MockHttpClient::default())
            .await
            .unwrap();
        let decoded = jwt::decode(&jwt).unwrap();
        assert_eq!(decoded.header.alg, "ES256K");
        assert_eq!(decoded.header.kid, Some(format!("{DID}#keys-1")));

        let signer = K256Signer::from_hex(HEX_KEY).unwrap();
        jwt::verify(&jwt, signer.jwk()).unwrap();
    }

    #[tokio::test]
    async fn supplied_signer() {
        let signer = Arc::new(P256Signer::from_hex(&"11".repeat(32)).unwrap());
        let signature = SignatureType::Supplied(SuppliedSignature {
            signer: signer.clone(),
            did: "did:example:rp".into(),
            kid: "did:example:rp#key-1".into(),
        });
        let jwt = signature
            .sign_jwt(json!({ "a": 1 }).as_object().unwrap(), &MockHttpClient::default())
            .await
            .unwrap();
        assert_eq!(jwt::decode(&jwt).unwrap().header.alg, "ES256");
        jwt::verify(&jwt, signer.jwk()).unwrap();
    }

    #[tokio::test]
    async fn missing_key_id() {
        let signature = SignatureType::Internal(InternalSignature {
            hex_private_key: HEX_KEY.into(),
            did: DID.into(),
            kid: String::new(),
            alg: None,
        });
        let err = signature
            .sign_jwt(&Map::new(), &MockHttpClient::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadSignatureParams(_)));
    }

    #[tokio::test]
    async fn external_endpoint() {
        let client = MockHttpClient::default().with_json(
            "https://signer.example/sign",
            json!({ "jws": "eyJhbGciOiJFUzI1NksifQ.eyJhIjoxfQ.c2ln" }),
        );
        let signature = SignatureType::try_from(json!({
            "signatureUri": "https://signer.example/sign",
            "authZToken": "token",
            "did": DID,
            "kid": format!("{DID}#keys-1"),
        }))
        .unwrap();

        let jwt = signature.sign_jwt(&Map::new(), &client).await.unwrap();
        assert_eq!(jwt, "eyJhbGciOiJFUzI1NksifQ.eyJhIjoxfQ.c2ln");
    }

    #[tokio::test]
    async fn internal_key_length_picks_eddsa() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let signature = SignatureType::Internal(InternalSignature {
            hex_private_key: hex::encode(key.to_keypair_bytes()),
            did: "did:example:ed".into(),
            kid: "did:example:ed#key-1".into(),
            alg: None,
        });
        let jwt = signature
            .sign_jwt(&Map::new(), &MockHttpClient::default())
            .await
            .unwrap();
        assert_eq!(jwt::decode(&jwt).unwrap().header.alg, "EdDSA");
    }
}
