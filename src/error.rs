use thiserror::Error;

/// Failures surfaced by request/response construction and verification.
///
/// Each variant carries a human readable detail. Collaborator failures (HTTP, DID resolution,
/// callbacks) are folded into the variant of the gate that invoked them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bad parameters: {0}")]
    BadParams(String),
    #[error("bad signature parameters: {0}")]
    BadSignatureParams(String),
    #[error("validation failure: {0}")]
    ValidationFailure(String),
    #[error("signature verification failure: {0}")]
    SignatureVerificationFailure(String),
    #[error("nonce or state mismatch: {0}")]
    NonceOrStateMismatch(String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("presentation definition conflict: {0}")]
    PresentationDefinitionConflict(String),
    #[error("presentation match failure: {0}")]
    PresentationMatchFailure(String),
    #[error("external fetch failure: {0}")]
    ExternalFetchFailure(String),
    #[error("linked domain failure: {0}")]
    LinkedDomainFailure(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Folds a collaborator `anyhow` error into the taxonomy, keeping its context chain.
pub(crate) trait ErrorKind<T> {
    fn bad_params(self) -> Result<T>;
    fn bad_signature_params(self) -> Result<T>;
    fn validation(self) -> Result<T>;
    fn signature(self) -> Result<T>;
    fn fetch(self) -> Result<T>;
    fn linked_domain(self) -> Result<T>;
    fn match_failure(self) -> Result<T>;
}

impl<T, E> ErrorKind<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn bad_params(self) -> Result<T> {
        self.map_err(|e| Error::BadParams(format!("{:#}", e.into())))
    }

    fn bad_signature_params(self) -> Result<T> {
        self.map_err(|e| Error::BadSignatureParams(format!("{:#}", e.into())))
    }

    fn validation(self) -> Result<T> {
        self.map_err(|e| Error::ValidationFailure(format!("{:#}", e.into())))
    }

    fn signature(self) -> Result<T> {
        self.map_err(|e| Error::SignatureVerificationFailure(format!("{:#}", e.into())))
    }

    fn fetch(self) -> Result<T> {
        self.map_err(|e| Error::ExternalFetchFailure(format!("{:#}", e.into())))
    }

    fn linked_domain(self) -> Result<T> {
        self.map_err(|e| Error::LinkedDomainFailure(format!("{:#}", e.into())))
    }

    fn match_failure(self) -> Result<T> {
        self.map_err(|e| Error::PresentationMatchFailure(format!("{:#}", e.into())))
    }
}
