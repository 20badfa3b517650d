use serde::Serialize;
use thiserror::Error;

use crate::core::options::ConfigurationError;

/// Failure of a whole run. Every variant is fatal.
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("account registration failed: {detail}")]
    Registration { detail: String },
    #[error("terms of service not agreed: {detail}")]
    TermsNotAgreed { detail: String },
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] CertificateFailure),
    #[error("issuance interrupted")]
    Interrupted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("authorization for {domain} failed: {failure}")]
pub struct AuthorizationError {
    pub domain: String,
    pub failure: AuthorizationFailure,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorizationFailure {
    #[error("challenge rejected by the CA: {detail}")]
    ChallengeRejected { detail: String },
    #[error("validation did not finish after {attempts} checks in {elapsed_ms}ms")]
    ValidationTimeout { attempts: u32, elapsed_ms: u64 },
    #[error("authorization expired before it was validated")]
    ValidationExpired,
    #[error("the CA offered no http-01 challenge")]
    ChallengeUnavailable,
    #[error("could not publish the challenge response: {detail}")]
    PublicationFailed { detail: String },
    #[error("CA unavailable: {detail}")]
    CaUnavailable { detail: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateFailure {
    /// The CA refused to open an order (rate limit, policy, unsupported name).
    #[error("order refused: {0}")]
    OrderRejected(String),
    #[error("CSR rejected: {0}")]
    CsrRejected(String),
    #[error("CA unavailable: {0}")]
    CaUnavailable(String),
    #[error("certificate retrieval failed: {0}")]
    RetrievalFailed(String),
}
