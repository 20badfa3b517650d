use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::{AuthorizationStatus, ChallengeKind};
use crate::domain::DomainSet;
use crate::issuance::account::{Account, AccountKey};

pub const PROBLEM_ACCOUNT_DOES_NOT_EXIST: &str =
    "urn:ietf:params:acme:error:accountDoesNotExist";
pub const PROBLEM_ACCOUNT_EXISTS: &str = "urn:ietf:params:acme:error:accountAlreadyExists";
pub const PROBLEM_USER_ACTION_REQUIRED: &str = "urn:ietf:params:acme:error:userActionRequired";

/// Operations the issuance workflow needs from an ACME certificate authority.
/// Implementations must be safe to call from concurrent per-domain tasks.
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Registers `key` with the given `mailto:` contacts. A key that already has
    /// an account yields `created = false`.
    async fn register_account(
        &self,
        key: &AccountKey,
        contact: &[String],
    ) -> Result<NewAccount, CaError>;

    /// URL of the account already bound to `key`.
    async fn lookup_account(&self, key: &AccountKey) -> Result<String, CaError>;

    async fn agree_to_terms(&self, account: &Account) -> Result<(), CaError>;

    async fn new_order(&self, account: &Account, domains: &DomainSet)
    -> Result<OrderHandle, CaError>;

    async fn authorization(
        &self,
        account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError>;

    async fn notify_challenge_ready(
        &self,
        account: &Account,
        challenge: &ChallengeDetails,
    ) -> Result<(), CaError>;

    async fn authorization_status(
        &self,
        account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError>;

    async fn submit_csr(
        &self,
        account: &Account,
        order: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<OrderState, CaError>;

    async fn order_status(&self, account: &Account, order: &OrderHandle)
    -> Result<OrderState, CaError>;

    /// Downloads the PEM chain, leaf first.
    async fn fetch_certificate(
        &self,
        account: &Account,
        certificate_url: &str,
    ) -> Result<String, CaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub url: String,
    pub created: bool,
}

/// An order as created by the CA: where to finalize and one authorization URL
/// per requested domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub url: String,
    pub finalize_url: String,
    pub authorizations: HashMap<String, String>,
}

impl OrderHandle {
    pub fn authorization_url(&self, domain: &str) -> Option<&str> {
        self.authorizations.get(domain).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderState {
    pub status: OrderStatus,
    pub certificate_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetails {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDetails {
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<ChallengeDetails>,
    /// Problem detail attached to a failed challenge, if any.
    pub error: Option<String>,
}

impl AuthorizationDetails {
    pub fn challenge(&self, kind: ChallengeKind) -> Option<&ChallengeDetails> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaError {
    #[error("CA rejected the request ({problem_type}): {detail}")]
    Rejected { problem_type: String, detail: String },
    #[error("an account already exists for this key")]
    AccountExists,
    #[error("CA transport error: {0}")]
    Transport(String),
    #[error("unexpected CA response: {0}")]
    Protocol(String),
}

impl CaError {
    /// RFC 8555 problem type of a rejection.
    pub fn problem_type(&self) -> Option<&str> {
        match self {
            Self::Rejected { problem_type, .. } => Some(problem_type),
            _ => None,
        }
    }

    /// Human-readable cause, without the HTTP framing.
    pub fn detail(&self) -> String {
        match self {
            Self::Rejected { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}
