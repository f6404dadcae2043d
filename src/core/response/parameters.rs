pub use crate::core::authorization_request::parameters::{Nonce, State};
use crate::core::object::TypedParameter;

use anyhow::{bail, Error};
use serde_json::Value as Json;

pub const SELF_ISSUED_ISSUER: &str = "https://self-issued.me/v2";

/// Response fields that travel as serialized JSON in a form body.
pub const JSON_PARAMETERS: [&str; 2] = ["vp_token", "presentation_submission"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdToken(pub String);

impl TypedParameter for IdToken {
    const KEY: &'static str = "id_token";
}

impl TryFrom<Json> for IdToken {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        serde_json::from_value(value).map(Self).map_err(Into::into)
    }
}

impl From<IdToken> for Json {
    fn from(value: IdToken) -> Self {
        value.0.into()
    }
}

/// The `vp_token` response parameter: one presentation or a list of them.
///
/// A presentation is a compact JWT (a JSON string) or a JSON-LD object.
#[derive(Debug, Clone, PartialEq)]
pub enum VpToken {
    Single(Json),
    Many(Vec<Json>),
}

impl VpToken {
    pub fn presentations(&self) -> Vec<Json> {
        match self {
            VpToken::Single(p) => vec![p.clone()],
            VpToken::Many(ps) => ps.clone(),
        }
    }
}

impl TypedParameter for VpToken {
    const KEY: &'static str = "vp_token";
}

impl TryFrom<Json> for VpToken {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        match value {
            Json::Array(items) => {
                if items.iter().any(|i| !(i.is_string() || i.is_object())) {
                    bail!("every presentation in 'vp_token' must be a string or an object")
                }
                Ok(Self::Many(items))
            }
            single @ (Json::String(_) | Json::Object(_)) => Ok(Self::Single(single)),
            _ => bail!("invalid vp_token"),
        }
    }
}

impl From<VpToken> for Json {
    fn from(value: VpToken) -> Self {
        match value {
            VpToken::Single(p) => p,
            VpToken::Many(ps) => Json::Array(ps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audience(pub String);

impl TypedParameter for Audience {
    const KEY: &'static str = "aud";
}

impl TryFrom<Json> for Audience {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<Audience> for Json {
    fn from(value: Audience) -> Json {
        Json::String(value.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

impl TypedParameter for Subject {
    const KEY: &'static str = "sub";
}

impl TryFrom<Json> for Subject {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        Ok(Self(serde_json::from_value(value)?))
    }
}

impl From<Subject> for Json {
    fn from(value: Subject) -> Json {
        Json::String(value.0)
    }
}
