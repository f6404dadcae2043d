pub mod authorization_request;
pub mod did;
pub mod jwt;
pub mod linked_domain;
pub mod metadata;
pub mod object;
pub mod presentation_definition;
pub mod presentation_exchange;
pub mod presentation_submission;
pub mod request_object;
pub mod response;
pub mod signer;
pub mod util;
pub mod version;
