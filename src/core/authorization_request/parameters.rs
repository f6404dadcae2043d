use std::fmt;

use crate::core::object::TypedParameter;
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use url::Url;

const OPENID: &str = "openid";
const ID_TOKEN: &str = "id_token";
const VP_TOKEN: &str = "vp_token";
const ID_TOKEN_VP_TOKEN: &str = "id_token vp_token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

impl TypedParameter for ClientId {
    const KEY: &'static str = "client_id";
}

impl TryFrom<Json> for ClientId {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<ClientId> for Json {
    fn from(value: ClientId) -> Self {
        Json::String(value.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(into = "String", from = "String")]
pub enum ResponseType {
    #[default]
    IdToken,
    VpToken,
    IdTokenVpToken,
    Unsupported(String),
}

impl ResponseType {
    pub fn includes_id_token(&self) -> bool {
        matches!(self, ResponseType::IdToken | ResponseType::IdTokenVpToken)
    }

    pub fn includes_vp_token(&self) -> bool {
        matches!(self, ResponseType::VpToken | ResponseType::IdTokenVpToken)
    }
}

impl From<ResponseType> for String {
    fn from(rt: ResponseType) -> Self {
        match rt {
            ResponseType::IdToken => ID_TOKEN.into(),
            ResponseType::VpToken => VP_TOKEN.into(),
            ResponseType::IdTokenVpToken => ID_TOKEN_VP_TOKEN.into(),
            ResponseType::Unsupported(s) => s,
        }
    }
}

impl From<String> for ResponseType {
    fn from(s: String) -> Self {
        let mut parts: Vec<&str> = s.split_whitespace().collect();
        parts.sort_unstable();
        match parts.as_slice() {
            [ID_TOKEN] => ResponseType::IdToken,
            [VP_TOKEN] => ResponseType::VpToken,
            [ID_TOKEN, VP_TOKEN] => ResponseType::IdTokenVpToken,
            _ => ResponseType::Unsupported(s),
        }
    }
}

impl TypedParameter for ResponseType {
    const KEY: &'static str = "response_type";
}

impl TryFrom<Json> for ResponseType {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        let s: String = serde_json::from_value(value)?;
        Ok(s.into())
    }
}

impl From<ResponseType> for Json {
    fn from(rt: ResponseType) -> Self {
        Json::String(rt.into())
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        String::from(self.clone()).fmt(f)
    }
}

/// Space separated scopes, always including `openid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope(pub String);

impl Scope {
    /// `scope` if it already asks for `openid`, plain `openid` otherwise.
    pub fn openid(scope: Option<&str>) -> Self {
        match scope {
            Some(s) if s.split_whitespace().any(|s| s == OPENID) => Self(s.to_string()),
            _ => Self(OPENID.into()),
        }
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.split_whitespace().any(|s| s == scope)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self(OPENID.into())
    }
}

impl TypedParameter for Scope {
    const KEY: &'static str = "scope";
}

impl TryFrom<Json> for Scope {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<Scope> for Json {
    fn from(value: Scope) -> Self {
        Json::String(value.0)
    }
}

/// `redirect_uri` field in the Authorization Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectUri(pub Url);

impl TypedParameter for RedirectUri {
    const KEY: &'static str = "redirect_uri";
}

impl TryFrom<Json> for RedirectUri {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value).map(Self)?)
    }
}

impl From<RedirectUri> for Json {
    fn from(value: RedirectUri) -> Self {
        value.0.to_string().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce(pub String);

impl TypedParameter for Nonce {
    const KEY: &'static str = "nonce";
}

impl TryFrom<Json> for Nonce {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<Nonce> for Json {
    fn from(value: Nonce) -> Self {
        Json::String(value.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State(pub String);

impl TypedParameter for State {
    const KEY: &'static str = "state";
}

impl TryFrom<Json> for State {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<State> for Json {
    fn from(value: State) -> Self {
        Json::String(value.0)
    }
}

/// A request object passed by value, as a compact JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request(pub String);

impl TypedParameter for Request {
    const KEY: &'static str = "request";
}

impl TryFrom<Json> for Request {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<Request> for Json {
    fn from(value: Request) -> Self {
        Json::String(value.0)
    }
}

/// A request object passed by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUri(pub Url);

impl TypedParameter for RequestUri {
    const KEY: &'static str = "request_uri";
}

impl TryFrom<Json> for RequestUri {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value).map(Self)?)
    }
}

impl From<RequestUri> for Json {
    fn from(value: RequestUri) -> Self {
        value.0.to_string().into()
    }
}

/// `registration` field of the earlier dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration(pub Json);

impl TypedParameter for Registration {
    const KEY: &'static str = "registration";
}

impl TryFrom<Json> for Registration {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        if !value.is_object() {
            bail!("'registration' must be an object")
        }
        Ok(Self(value))
    }
}

impl From<Registration> for Json {
    fn from(value: Registration) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationUri(pub Url);

impl TypedParameter for RegistrationUri {
    const KEY: &'static str = "registration_uri";
}

impl TryFrom<Json> for RegistrationUri {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value).map(Self)?)
    }
}

impl From<RegistrationUri> for Json {
    fn from(value: RegistrationUri) -> Self {
        value.0.to_string().into()
    }
}

/// `client_metadata` field in the Authorization Request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMetadata(pub Json);

impl TypedParameter for ClientMetadata {
    const KEY: &'static str = "client_metadata";
}

impl TryFrom<Json> for ClientMetadata {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        if !value.is_object() {
            bail!("'client_metadata' must be an object")
        }
        Ok(Self(value))
    }
}

impl From<ClientMetadata> for Json {
    fn from(value: ClientMetadata) -> Self {
        value.0
    }
}

/// `client_metadata_uri` field in the Authorization Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetadataUri(pub Url);

impl TypedParameter for ClientMetadataUri {
    const KEY: &'static str = "client_metadata_uri";
}

impl TryFrom<Json> for ClientMetadataUri {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value).map(Self)?)
    }
}

impl From<ClientMetadataUri> for Json {
    fn from(value: ClientMetadataUri) -> Self {
        value.0.to_string().into()
    }
}

/// The `claims` request parameter, which in the earlier dialects can carry
/// `vp_token.presentation_definition`.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims(pub Json);

impl TypedParameter for Claims {
    const KEY: &'static str = "claims";
}

impl TryFrom<Json> for Claims {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        if !value.is_object() {
            bail!("'claims' must be an object")
        }
        Ok(Self(value))
    }
}

impl From<Claims> for Json {
    fn from(value: Claims) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMode(pub String);

impl TypedParameter for ResponseMode {
    const KEY: &'static str = "response_mode";
}

impl TryFrom<Json> for ResponseMode {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<ResponseMode> for Json {
    fn from(value: ResponseMode) -> Self {
        Json::String(value.0)
    }
}
