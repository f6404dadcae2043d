//! Compact JWS helpers over `ssi`: decoding, verification with a JWK, and key conversion.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Error, Result};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use ssi::claims::{JWTClaims, JwsPayload};
use ssi::jwk::{Algorithm, JWK};

use crate::core::object::UntypedObject;

/// Algorithms accepted on inbound tokens. `none` is never accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgo {
    EdDSA,
    RS256,
    PS256,
    ES256,
    ES256K,
}

impl SigningAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgo::EdDSA => "EdDSA",
            SigningAlgo::RS256 => "RS256",
            SigningAlgo::PS256 => "PS256",
            SigningAlgo::ES256 => "ES256",
            SigningAlgo::ES256K => "ES256K",
        }
    }
}

impl fmt::Display for SigningAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for SigningAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "EdDSA" => SigningAlgo::EdDSA,
            "RS256" => SigningAlgo::RS256,
            "PS256" => SigningAlgo::PS256,
            "ES256" => SigningAlgo::ES256,
            "ES256K" => SigningAlgo::ES256K,
            other => bail!("signing algorithm '{other}' is not allowed"),
        })
    }
}

impl From<SigningAlgo> for Algorithm {
    fn from(alg: SigningAlgo) -> Self {
        match alg {
            SigningAlgo::EdDSA => Algorithm::EdDSA,
            SigningAlgo::RS256 => Algorithm::RS256,
            SigningAlgo::PS256 => Algorithm::PS256,
            SigningAlgo::ES256 => Algorithm::ES256,
            SigningAlgo::ES256K => Algorithm::ES256K,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

impl JwtHeader {
    pub fn new(alg: SigningAlgo, kid: impl Into<String>) -> Self {
        Self {
            alg: alg.to_string(),
            kid: Some(kid.into()),
            typ: Some("JWT".into()),
        }
    }

    /// Parse `alg` against the allow-list.
    pub fn algorithm(&self) -> Result<SigningAlgo> {
        self.alg.parse()
    }
}

/// A decoded, not yet verified, compact JWT.
#[derive(Debug, Clone)]
pub struct DecodedJwt {
    pub header: JwtHeader,
    pub payload: UntypedObject,
}

impl DecodedJwt {
    /// The DID the token claims to be signed by: `kid` without its fragment, else `iss`.
    pub fn signer_did(&self) -> Option<String> {
        self.header
            .kid
            .as_deref()
            .filter(|kid| kid.starts_with("did:"))
            .map(|kid| kid.split('#').next().unwrap_or(kid).to_string())
            .or_else(|| {
                self.payload
                    .get_str("iss")
                    .filter(|iss| iss.starts_with("did:"))
                    .map(str::to_string)
            })
    }
}

/// Whether the value has the shape of a compact JWS: three base64url segments whose
/// header starts with `ey` (the encoding of `{"`).
pub fn is_compact_jwt(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    segments.len() == 3
        && value.starts_with("ey")
        && segments[..2].iter().all(|s| {
            !s.is_empty()
                && s
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Decode the header and payload of a compact JWT without verifying it.
pub fn decode(jwt: &str) -> Result<DecodedJwt> {
    let (header_b64, payload_b64, _) =
        ssi::claims::jws::split_jws(jwt).context("expected a JWT with three segments")?;

    let header: JwtHeader = serde_json::from_slice(
        &BASE64_URL_SAFE_NO_PAD
            .decode(header_b64)
            .context("header is not base64url")?,
    )
    .context("header is not a JOSE header")?;

    let payload: Json = serde_json::from_slice(
        &BASE64_URL_SAFE_NO_PAD
            .decode(payload_b64)
            .context("payload is not base64url")?,
    )
    .context("payload is not JSON")?;

    Ok(DecodedJwt {
        header,
        payload: payload.try_into().context("payload is not a JSON object")?,
    })
}

/// Check the signature of a compact JWT against a public key.
pub fn verify(jwt: &str, jwk: &JWK) -> Result<()> {
    let _: Json =
        ssi::claims::jwt::decode_verify(jwt, jwk).context("JWT signature does not match")?;
    Ok(())
}

/// Sign `payload` with a private key. `kid` comes from the key's `key_id`.
pub async fn sign(payload: &Map<String, Json>, jwk: &JWK) -> Result<String> {
    let jws = JWTClaims::from_private_claims(payload.clone())
        .sign(jwk)
        .await
        .context("failed to sign JWT")?;
    Ok(jws.as_str().to_string())
}

fn hex_bytes(key: &str) -> Result<Vec<u8>> {
    hex::decode(key.trim_start_matches("0x")).context("key is not hex")
}

/// The private JWK for a hex encoded secret key.
///
/// EdDSA accepts a 32 byte secret or a 64 byte secret-and-public keypair.
pub fn private_jwk_from_hex(alg: SigningAlgo, key: &str) -> Result<JWK> {
    let bytes = hex_bytes(key)?;
    let jwk = match alg {
        SigningAlgo::ES256 => {
            let key = p256::SecretKey::from_slice(&bytes).context("invalid P-256 private key")?;
            serde_json::from_str(&key.to_jwk_string())?
        }
        SigningAlgo::ES256K => {
            let key =
                k256::SecretKey::from_slice(&bytes).context("invalid secp256k1 private key")?;
            serde_json::from_str(&key.to_jwk_string())?
        }
        SigningAlgo::EdDSA => {
            let key = match bytes.len() {
                32 => {
                    let secret: [u8; 32] = bytes.as_slice().try_into()?;
                    ed25519_dalek::SigningKey::from_bytes(&secret)
                }
                64 => {
                    let keypair: [u8; 64] = bytes.as_slice().try_into()?;
                    ed25519_dalek::SigningKey::from_keypair_bytes(&keypair)
                        .context("invalid Ed25519 keypair")?
                }
                n => bail!("Ed25519 private keys are 32 or 64 bytes, found {n}"),
            };
            serde_json::from_value(json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "x": BASE64_URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
                "d": BASE64_URL_SAFE_NO_PAD.encode(key.to_bytes()),
            }))?
        }
        SigningAlgo::RS256 | SigningAlgo::PS256 => {
            bail!("hex encoded {alg} keys are not supported")
        }
    };
    Ok(jwk)
}

/// The public JWK for a hex encoded public key, as found in `publicKeyHex`.
pub fn public_jwk_from_hex(alg: SigningAlgo, key: &str) -> Result<JWK> {
    let bytes = hex_bytes(key)?;
    let jwk = match alg {
        SigningAlgo::ES256 => {
            let key = p256::PublicKey::from_sec1_bytes(&bytes).context("invalid P-256 key")?;
            serde_json::from_str(&key.to_jwk_string())?
        }
        SigningAlgo::ES256K => {
            let key = k256::PublicKey::from_sec1_bytes(&bytes).context("invalid secp256k1 key")?;
            serde_json::from_str(&key.to_jwk_string())?
        }
        SigningAlgo::EdDSA => {
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .context("Ed25519 keys are 32 bytes")?;
            ed25519_dalek::VerifyingKey::from_bytes(&key).context("invalid Ed25519 key")?;
            serde_json::from_value(json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "x": BASE64_URL_SAFE_NO_PAD.encode(key),
            }))?
        }
        SigningAlgo::RS256 | SigningAlgo::PS256 => {
            bail!("hex encoded {alg} keys are not supported")
        }
    };
    Ok(jwk)
}

#[cfg(test)]
mod test {
    use super::*;

    const ES256K_KEY: &str = "f857544a9d1097e242ff0b287a7e6e90f19cf973efe2317f2a4678739664420f";

    #[test]
    fn allow_list() {
        assert_eq!("ES256K".parse::<SigningAlgo>().unwrap(), SigningAlgo::ES256K);
        assert!("none".parse::<SigningAlgo>().is_err());
        assert!("HS256".parse::<SigningAlgo>().is_err());
    }

    #[test]
    fn compact_shape() {
        assert!(is_compact_jwt("eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ.c2ln"));
        assert!(!is_compact_jwt("openid://?request=eyJ"));
        assert!(!is_compact_jwt("eyJhbGciOiJFUzI1NiJ9.eyJhIjoxfQ"));
    }

    #[tokio::test]
    async fn sign_decode_and_verify() {
        let mut jwk = private_jwk_from_hex(SigningAlgo::ES256K, ES256K_KEY).unwrap();
        jwk.key_id = Some("did:example:123#key-1".into());

        let payload = json!({ "iss": "did:example:123", "nonce": "n" });
        let jwt = sign(payload.as_object().unwrap(), &jwk).await.unwrap();

        let decoded = decode(&jwt).unwrap();
        assert_eq!(decoded.header.algorithm().unwrap(), SigningAlgo::ES256K);
        assert_eq!(decoded.header.kid.as_deref(), Some("did:example:123#key-1"));
        assert_eq!(decoded.signer_did().as_deref(), Some("did:example:123"));
        verify(&jwt, &jwk.to_public()).unwrap();

        let other = private_jwk_from_hex(SigningAlgo::ES256K, &"22".repeat(32)).unwrap();
        assert!(verify(&jwt, &other.to_public()).is_err());
    }

    #[test]
    fn hex_keys() {
        let ed = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let from_secret = private_jwk_from_hex(SigningAlgo::EdDSA, &hex::encode([9u8; 32])).unwrap();
        let from_pair =
            private_jwk_from_hex(SigningAlgo::EdDSA, &hex::encode(ed.to_keypair_bytes())).unwrap();
        assert_eq!(from_secret, from_pair);
        assert_eq!(
            public_jwk_from_hex(SigningAlgo::EdDSA, &hex::encode(ed.verifying_key().as_bytes()))
                .unwrap(),
            from_secret.to_public()
        );
        assert!(private_jwk_from_hex(SigningAlgo::EdDSA, "abcd").is_err());
        assert!(private_jwk_from_hex(SigningAlgo::RS256, ES256K_KEY).is_err());
    }
}
