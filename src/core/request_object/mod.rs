//! The signed request object at the heart of an authorization request.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::core::authorization_request::opts::{
    CreateAuthorizationRequestOpts, PassBy, DEFAULT_EXPIRES_IN,
};
use crate::core::authorization_request::payload::request_parameters;
use crate::core::jwt;
use crate::core::object::UntypedObject;
use crate::core::signer::SignatureType;
use crate::core::util::{get_text, AsyncHttpClient};
use crate::error::{Error, ErrorKind, Result};
use crate::utils::now;

/// A request object payload, optionally paired with the means to sign it.
///
/// The compact token is produced at most once per instance.
pub struct RequestObject {
    payload: UntypedObject,
    signer: Option<(SignatureType, Arc<dyn AsyncHttpClient>)>,
    jwt: OnceCell<String>,
}

impl fmt::Debug for RequestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestObject")
            .field("payload", &self.payload)
            .field("signer", &self.signer.as_ref().map(|(s, _)| s))
            .field("jwt", &self.jwt.get())
            .finish()
    }
}

impl RequestObject {
    /// A request object that will be signed with `signature` on first use.
    pub fn new(
        payload: UntypedObject,
        signature: SignatureType,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Self {
        Self {
            payload,
            signer: Some((signature, http_client)),
            jwt: OnceCell::new(),
        }
    }

    /// Build the request object for a request, or `None` when it is not passed along.
    ///
    /// `opts` must already carry its defaults.
    pub fn from_opts(
        opts: &CreateAuthorizationRequestOpts,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Result<Option<Self>> {
        if opts.pass_by() == PassBy::None {
            return Ok(None);
        }
        let signature = opts.signature().cloned().ok_or_else(|| {
            Error::BadSignatureParams("a request object that is passed along must be signed".into())
        })?;

        let mut payload = request_parameters(opts)?;
        let iat = now();
        payload.insert_raw("iss", Json::String(signature.did().to_string()));
        payload.insert_raw("iat", iat.into());
        payload.insert_raw("nbf", iat.into());
        let expires_in = opts.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        payload.insert_raw("exp", (iat + expires_in).into());
        payload.insert_raw("jti", Json::String(uuid::Uuid::new_v4().to_string()));

        Ok(Some(Self::new(payload, signature, http_client)))
    }

    /// Wrap a received token. The signature is not verified.
    pub fn from_jwt(token: &str) -> Result<Self> {
        let decoded = jwt::decode(token).validation()?;
        Ok(Self {
            payload: decoded.payload,
            signer: None,
            jwt: OnceCell::new_with(Some(token.to_string())),
        })
    }

    /// The request object an outer request carries by value, or fetches by reference.
    pub async fn from_authorization_request_payload(
        payload: &UntypedObject,
        http_client: &dyn AsyncHttpClient,
    ) -> Result<Option<Self>> {
        if let Some(request) = payload.get_str("request") {
            return Self::from_jwt(request).map(Some);
        }
        if let Some(reference) = payload.get_str("request_uri") {
            let url: Url = reference
                .parse()
                .map_err(|e| Error::BadParams(format!("invalid request_uri '{reference}': {e}")))?;
            debug!("fetching request object from {url}");
            let token = get_text(http_client, &url).await?;
            return Self::from_jwt(token.trim()).map(Some);
        }
        Ok(None)
    }

    pub fn payload(&self) -> &UntypedObject {
        &self.payload
    }

    pub fn is_signed(&self) -> bool {
        self.jwt.initialized() || self.signer.is_some()
    }

    /// The compact token, signing the payload on first call.
    ///
    /// `None` for an unsigned request object.
    pub async fn to_jwt(&self) -> Result<Option<String>> {
        if let Some(jwt) = self.jwt.get() {
            return Ok(Some(jwt.clone()));
        }
        let Some((signature, http_client)) = &self.signer else {
            return Ok(None);
        };
        let jwt = self
            .jwt
            .get_or_try_init(|| async {
                debug!("signing request object as {}", signature.kid());
                signature
                    .sign_jwt(self.payload.as_map(), http_client.as_ref())
                    .await
            })
            .await?;
        Ok(Some(jwt.clone()))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::jwt::SigningAlgo;
    use crate::core::signer::{P256Signer, RequestSigner, SuppliedSignature};
    use crate::core::util::test_utils::MockHttpClient;

    #[derive(Debug)]
    struct Counting {
        inner: P256Signer,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestSigner for Counting {
        fn alg(&self) -> SigningAlgo {
            self.inner.alg()
        }

        fn jwk(&self) -> &ssi::jwk::JWK {
            self.inner.jwk()
        }

        async fn sign(&self, payload: &[u8]) -> AnyResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.sign(payload).await
        }
    }

    #[tokio::test]
    async fn signs_once() {
        let signer = Arc::new(Counting {
            inner: P256Signer::new(p256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
                .unwrap(),
            calls: AtomicUsize::new(0),
        });
        let request_object = RequestObject::new(
            json!({ "client_id": "rp" }).try_into().unwrap(),
            SignatureType::Supplied(SuppliedSignature {
                signer: signer.clone(),
                did: "did:example:rp".into(),
                kid: "did:example:rp#key-1".into(),
            }),
            Arc::new(MockHttpClient::default()),
        );

        let first = request_object.to_jwt().await.unwrap().unwrap();
        let second = request_object.to_jwt().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(jwt::is_compact_jwt(&first));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parsed_tokens_are_not_resigned() {
        let token = "eyJhbGciOiJFUzI1NiJ9.eyJjbGllbnRfaWQiOiJycCJ9.c2ln";
        let request_object = RequestObject::from_jwt(token).unwrap();
        assert_eq!(request_object.payload().get_str("client_id"), Some("rp"));
        assert_eq!(request_object.to_jwt().await.unwrap().as_deref(), Some(token));
    }

    #[tokio::test]
    async fn by_reference() {
        let token = "eyJhbGciOiJFUzI1NiJ9.eyJjbGllbnRfaWQiOiJycCJ9.c2ln";
        let client = MockHttpClient::default().with_status("https://rp.example/ro", 200, token);
        let payload = json!({ "request_uri": "https://rp.example/ro" }).try_into().unwrap();
        let request_object = RequestObject::from_authorization_request_payload(&payload, &client)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request_object.payload().get_str("client_id"), Some("rp"));

        let missing = json!({ "request_uri": "https://rp.example/missing" })
            .try_into()
            .unwrap();
        let err = RequestObject::from_authorization_request_payload(&missing, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalFetchFailure(_)));
    }
}
