use std::sync::Arc;

use serde_json::Value as Json;
use url::Url;

use crate::core::object::UntypedObject;
use crate::core::util::{get_text, AsyncHttpClient};
use crate::error::{Error, ErrorKind, Result};

use super::opts::{CreateAuthorizationRequestOpts, DEFAULT_SCHEME};
use super::payload::AuthorizationRequestPayload;
use super::AuthorizationRequest;

pub const ENCODING_FORMAT: &str = "application/x-www-form-urlencoded";

/// Parameters that carry JSON objects and travel as a single serialized query value.
const JSON_PARAMETERS: [&str; 4] = [
    "registration",
    "claims",
    "client_metadata",
    "presentation_definition",
];

/// The wire form of an authorization request, `<scheme>://?<query>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Uri {
    scheme: String,
    encoded_uri: String,
    payload: AuthorizationRequestPayload,
    request_object_jwt: Option<String>,
}

impl Uri {
    pub async fn from_opts(
        opts: CreateAuthorizationRequestOpts,
        http_client: Arc<dyn AsyncHttpClient>,
    ) -> Result<Self> {
        let request = AuthorizationRequest::from_opts(opts, http_client).await?;
        Self::from_authorization_request(&request).await
    }

    pub async fn from_authorization_request(request: &AuthorizationRequest) -> Result<Self> {
        let scheme = request
            .options()
            .map(|o| o.scheme().to_string())
            .unwrap_or_else(|| DEFAULT_SCHEME.to_string());
        let payload = request.payload();
        Ok(Self {
            encoded_uri: encode(&scheme, &payload)?,
            scheme,
            request_object_jwt: request.request_object_jwt().await?,
            payload,
        })
    }

    /// Decode a URI without fetching anything it references.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, payload) = decode(uri)?;
        Ok(Self {
            scheme,
            encoded_uri: uri.to_string(),
            request_object_jwt: payload.request().map(str::to_string),
            payload,
        })
    }

    /// Decode a URI and fetch the request object it references.
    pub async fn from_uri(uri: &str, http_client: &dyn AsyncHttpClient) -> Result<Self> {
        let mut parsed = Self::parse(uri)?;
        if parsed.request_object_jwt.is_none() {
            if let Some(reference) = parsed.payload.request_uri() {
                let url: Url = reference
                    .parse()
                    .map_err(|e| Error::BadParams(format!("invalid request_uri '{reference}': {e}")))?;
                let token = get_text(http_client, &url).await?;
                parsed.request_object_jwt = Some(token.trim().to_string());
            }
        }
        Ok(parsed)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn encoded_uri(&self) -> &str {
        &self.encoded_uri
    }

    pub fn encoding_format(&self) -> &'static str {
        ENCODING_FORMAT
    }

    pub fn authorization_request_payload(&self) -> &AuthorizationRequestPayload {
        &self.payload
    }

    pub fn request_object_jwt(&self) -> Option<&str> {
        self.request_object_jwt.as_deref()
    }
}

/// Encode `payload` as `<scheme>://?<query>`. Non-string values are JSON serialized.
pub fn encode(scheme: &str, payload: &UntypedObject) -> Result<String> {
    let mut pairs = vec![];
    for (key, value) in payload.iter() {
        let value = match value {
            Json::Null => continue,
            Json::String(s) => s.clone(),
            other => serde_json::to_string(other).validation()?,
        };
        pairs.push((key.as_str(), value));
    }
    let query = serde_urlencoded::to_string(pairs).bad_params()?;
    Ok(format!("{scheme}://?{query}"))
}

/// Decode `<scheme>://?<query>` into its scheme and payload.
pub fn decode(uri: &str) -> Result<(String, AuthorizationRequestPayload)> {
    if uri.trim().is_empty() {
        return Err(Error::BadParams("an empty uri is not a request".into()));
    }
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::BadParams(format!("'{uri}' has no scheme")))?;
    let query = rest
        .split_once('?')
        .map(|(_, query)| query)
        .ok_or_else(|| Error::BadParams(format!("'{uri}' has no query")))?;

    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).bad_params()?;
    let mut payload = UntypedObject::new();
    for (key, value) in pairs {
        let value = if JSON_PARAMETERS.contains(&key.as_str()) {
            serde_json::from_str(&value).unwrap_or(Json::String(value))
        } else {
            Json::String(value)
        };
        payload.insert_raw(key, value);
    }
    Ok((scheme.to_string(), payload.into()))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trip() {
        let payload: UntypedObject = json!({
            "response_type": "id_token",
            "client_id": "did:example:rp",
            "redirect_uri": "https://acme.com/hello",
            "scope": "openid",
            "nonce": "n-0S6_WzA2Mj",
            "registration": {
                "subject_syntax_types_supported": ["did:ethr:", "did"],
                "client_name#nl-NL": "Acme & Zonen"
            },
            "claims": { "vp_token": { "presentation_definition": { "id": "pd" } } }
        })
        .try_into()
        .unwrap();

        let encoded = encode("openid", &payload).unwrap();
        assert!(encoded.starts_with("openid://?"));
        assert!(!encoded.contains('{'));

        let (scheme, decoded) = decode(&encoded).unwrap();
        assert_eq!(scheme, "openid");
        assert_eq!(decoded.0, payload);
    }

    #[test]
    fn bracketed_strings_stay_strings() {
        let payload: UntypedObject = json!({
            "client_id": "did:example:rp",
            "state": "[1,2]",
            "nonce": "{}",
            "claims": { "id_token": {} }
        })
        .try_into()
        .unwrap();

        let (_, decoded) = decode(&encode("openid", &payload).unwrap()).unwrap();
        assert_eq!(decoded.0.get_raw("state"), Some(&json!("[1,2]")));
        assert_eq!(decoded.0.get_raw("nonce"), Some(&json!("{}")));
        assert_eq!(decoded.0, payload);
    }

    #[test]
    fn registration_is_a_single_value() {
        let payload: UntypedObject = json!({ "registration": { "a": 1 } }).try_into().unwrap();
        let encoded = encode("openid", &payload).unwrap();
        assert_eq!(encoded.matches('=').count(), 1);
    }

    #[test]
    fn malformed() {
        assert!(matches!(decode(""), Err(Error::BadParams(_))));
        assert!(matches!(decode("openid-no-scheme"), Err(Error::BadParams(_))));
        assert!(matches!(decode("openid://"), Err(Error::BadParams(_))));
    }

    #[test]
    fn parse_keeps_inline_token() {
        let uri = Uri::parse("openid://?client_id=rp&request=eyJ.eyJ.sig").unwrap();
        assert_eq!(uri.request_object_jwt(), Some("eyJ.eyJ.sig"));
        assert_eq!(uri.encoding_format(), ENCODING_FORMAT);
        assert_eq!(uri.authorization_request_payload().client_id().as_deref(), Some("rp"));
    }
}
