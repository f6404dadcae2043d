//! This library provides a Rust implementation of the request/response core of
//! [SIOPv2] and [OpenID Connect for Verifiable Presentations].
//!
//! [SIOPv2]: <https://openid.net/specs/openid-connect-self-issued-v2-1_0.html>
//! [OpenID Connect for Verifiable Presentations]: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html>
//!
//! # Relying Party Usage
//!
//! ```ignore
//! use siopv2::rp::{Rp, RequestParams};
//!
//! let rp = Rp::builder()
//!     .with_client_id("did:ethr:0x0106a2e985b1E1De9B5ddb4aF6dC9e928F4e99D0")
//!     .with_redirect_uri("https://acme.com/hello".parse()?)
//!     .by_reference("https://rp.acme.com/siop/jwts".parse()?)
//!     .with_signature(signature)
//!     .with_registration(registration)
//!     .with_did_resolver("ethr", ethr_resolver)
//!     .build()?;
//!
//! let request = rp.create_authorization_request(RequestParams::default()).await?;
//! let uri = request.uri().await?;
//! // Serve `request.request_object_jwt()` at the reference URL, show `uri` to the user.
//! ```
//!
//! # Self-Issued OpenID Provider Usage
//!
//! ```ignore
//! use siopv2::op::{Op, ResponseParams};
//!
//! let op = Op::builder()
//!     .with_signature(signature)
//!     .with_did_resolver("ethr", ethr_resolver)
//!     .build()?;
//!
//! let verified = op.verify_authorization_request(uri.encoded_uri(), None).await?;
//! let response = op
//!     .create_authorization_response(&verified, ResponseParams::default())
//!     .await?;
//! op.submit_authorization_response(&response).await?;
//! ```
//!
//! # Protocol Overview
//!
//! 1. *RP creates request*: an [`AuthorizationRequest`] is built from options. Its parameters
//!    travel in a signed [`RequestObject`], by value (`request`) or by reference (`request_uri`),
//!    or unsigned at the top level of the request URI.
//! 2. *OP verifies request*: the request object signature is checked against the DID document
//!    of its signer, the dialect is negotiated ([`SupportedVersion`]), registration metadata is
//!    resolved and presentation definitions are discovered.
//! 3. *OP responds*: the [`AuthorizationResponse`] carries a self-issued id token and, when
//!    asked for, presentations matched against the definitions with [`PresentationExchange`].
//! 4. *RP verifies response*: id token signature, audience, nonce and state are checked and the
//!    presentations are validated against the definitions of the request.
//!
//! [`AuthorizationRequest`]: crate::core::authorization_request::AuthorizationRequest
//! [`RequestObject`]: crate::core::request_object::RequestObject
//! [`SupportedVersion`]: crate::core::version::SupportedVersion
//! [`AuthorizationResponse`]: crate::core::response::AuthorizationResponse
//! [`PresentationExchange`]: crate::core::presentation_exchange::PresentationExchange
//!
//! # Logging
//!
//! Flows emit [`tracing`] events; the library installs no subscriber.

pub mod config;
pub mod core;
pub mod error;
pub mod op;
pub mod rp;
pub mod utils;

pub use error::{Error, Result};
pub use serde_json_path::JsonPath;
