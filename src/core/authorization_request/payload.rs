use std::ops::{Deref, DerefMut};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::core::object::{ParsingErrorContext, TypedParameter, UntypedObject};
use crate::core::request_object::RequestObject;
use crate::error::{Error, ErrorKind, Result};

use super::opts::{CreateAuthorizationRequestOpts, PassBy};
use super::parameters::{
    Claims, ClientId, Nonce, RedirectUri, Request, RequestUri, ResponseMode, ResponseType, Scope,
    State,
};

/// The flat, top level parameters of an authorization request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationRequestPayload(pub UntypedObject);

impl AuthorizationRequestPayload {
    pub fn client_id(&self) -> Option<String> {
        self.0.get::<ClientId>()?.ok().map(|c| c.0)
    }

    pub fn response_type(&self) -> anyhow::Result<ResponseType> {
        self.0.get_or_default()
    }

    pub fn nonce(&self) -> Option<String> {
        self.0.get::<Nonce>()?.ok().map(|n| n.0)
    }

    pub fn state(&self) -> Option<String> {
        self.0.get::<State>()?.ok().map(|s| s.0)
    }

    pub fn redirect_uri(&self) -> anyhow::Result<RedirectUri> {
        self.0.get().parsing_error()
    }

    /// The request object passed by value.
    pub fn request(&self) -> Option<&str> {
        self.0.get_str(Request::KEY)
    }

    pub fn request_uri(&self) -> Option<&str> {
        self.0.get_str(RequestUri::KEY)
    }
}

impl From<UntypedObject> for AuthorizationRequestPayload {
    fn from(value: UntypedObject) -> Self {
        Self(value)
    }
}

impl From<AuthorizationRequestPayload> for Json {
    fn from(value: AuthorizationRequestPayload) -> Self {
        value.0.into()
    }
}

impl Deref for AuthorizationRequestPayload {
    type Target = UntypedObject;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AuthorizationRequestPayload {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The OAuth parameters shared by the request object and the outer request.
///
/// `opts` must already carry its defaults.
pub(crate) fn request_parameters(opts: &CreateAuthorizationRequestOpts) -> Result<UntypedObject> {
    let mut object = UntypedObject::new();
    let client_id = opts
        .client_id
        .clone()
        .ok_or_else(|| Error::BadParams("a client id is required".into()))?;
    let redirect_uri = opts
        .redirect_uri
        .clone()
        .ok_or_else(|| Error::BadParams("a redirect uri is required".into()))?;

    object.insert(opts.response_type.clone().unwrap_or_default());
    object.insert(ClientId(client_id));
    object.insert(RedirectUri(redirect_uri));
    object.insert(Scope::openid(opts.scope.as_deref()));
    if let Some(nonce) = &opts.nonce {
        object.insert(Nonce(nonce.clone()));
    }
    if let Some(state) = &opts.state {
        object.insert(State(state.clone()));
    }
    if let Some(mode) = &opts.response_mode {
        object.insert(ResponseMode(mode.clone()));
    }
    if let Some(claims) = &opts.claims {
        let claims = Claims::try_from(claims.clone()).bad_params()?;
        object.insert(claims);
    }
    if let Some(definition) = &opts.presentation_definition {
        object.insert_raw("presentation_definition", definition.clone());
    }

    if let Some(metadata) = &opts.client_metadata {
        let (value_key, reference_key) = metadata.keys();
        let m = metadata.metadata_opts();
        match m.pass_by {
            PassBy::None => {}
            PassBy::Value => {
                let value = serde_json::to_value(&m.metadata)
                    .context("failed to serialize metadata")
                    .bad_params()?;
                object.insert_raw(value_key, value);
            }
            PassBy::Reference => {
                let reference = m.reference_uri.as_ref().ok_or_else(|| {
                    Error::BadParams("metadata passed by reference requires a reference uri".into())
                })?;
                object.insert_raw(reference_key, Json::String(reference.to_string()));
            }
        }
    }

    Ok(object)
}

/// Assemble the outer request from its options and signed request object.
///
/// By reference the payload carries `request_uri`, by value the compact token as `request`.
/// Without a request object every parameter travels at the top level.
pub(crate) async fn create_authorization_request_payload(
    opts: &CreateAuthorizationRequestOpts,
    request_object: Option<&RequestObject>,
) -> Result<AuthorizationRequestPayload> {
    let mut payload = request_parameters(opts)?;

    match (opts.pass_by(), request_object) {
        (PassBy::None, _) => {}
        (PassBy::Reference, Some(_)) => {
            let reference = opts
                .request_object
                .as_ref()
                .and_then(|ro| ro.reference_uri.clone())
                .ok_or_else(|| {
                    Error::BadParams(
                        "a request object passed by reference requires a reference uri".into(),
                    )
                })?;
            payload.insert(RequestUri(reference));
        }
        (PassBy::Value, Some(request_object)) => {
            let jwt = request_object.to_jwt().await?.ok_or_else(|| {
                Error::BadSignatureParams("the request object could not be signed".into())
            })?;
            payload.insert(Request(jwt));
        }
        (_, None) => {
            return Err(Error::BadParams(
                "a request object is required unless it is omitted".into(),
            ))
        }
    }

    Ok(payload.into())
}
