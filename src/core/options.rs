use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{DomainError, DomainSet};
use crate::issuance::account::SUPPORTED_KEY_SIZES;
use crate::issuance::polling::PollPolicy;

pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const DEFAULT_SUPPORT_EMAIL: &str = "support@webfaction.com";
pub const DEFAULT_KEY_SIZE: u32 = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error(transparent)]
    Domains(#[from] DomainError),
    #[error("unsupported key size {0}. Allowed: 2048, 3072, 4096")]
    KeySize(u32),
    #[error("endpoint {0:?} must be an http(s) URL")]
    Endpoint(String),
    #[error("{field} {value:?} is not a valid email address")]
    Email { field: &'static str, value: String },
    #[error("output directory is required")]
    OutputDir,
    #[error("at least one document root is required when the host is not public")]
    NoDocumentRoots,
    #[error("polling configuration invalid: {0}")]
    Polling(String),
    #[error("max_concurrent_authorizations must be at least 1")]
    Concurrency,
}

/// Backoff and deadline settings shared by authorization and order polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_attempts: u32,
    pub validation_timeout: Duration,
    pub issuance_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(10),
            max_attempts: 60,
            validation_timeout: Duration::from_secs(180),
            issuance_timeout: Duration::from_secs(180),
        }
    }
}

impl PollingConfig {
    pub fn validation_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_interval: self.max_poll_interval,
            max_attempts: self.max_attempts,
            timeout: self.validation_timeout,
        }
    }

    pub fn issuance_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_interval: self.max_poll_interval,
            max_attempts: self.max_attempts,
            timeout: self.issuance_timeout,
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::Polling(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::Polling(
                "poll_interval must be positive".into(),
            ));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(ConfigurationError::Polling(
                "max_poll_interval must not be shorter than poll_interval".into(),
            ));
        }
        if self.validation_timeout.is_zero() || self.issuance_timeout.is_zero() {
            return Err(ConfigurationError::Polling("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Everything one issuance run needs to know, as parsed from the command line.
#[derive(Debug, Clone)]
pub struct IssuanceOptions {
    /// Host names in certificate order; the first becomes the common name.
    pub domains: Vec<String>,
    pub output_dir: PathBuf,
    /// RSA size for both the account key and the certificate key.
    pub key_size: u32,
    /// ACME directory URL.
    pub endpoint: String,
    /// Address of the hosting account owner, copied on the installation request.
    pub account_email: String,
    /// Registration contact sent to the CA. Falls back to `account_email`.
    pub letsencrypt_account_email: Option<String>,
    pub support_email: String,
    pub admin_notification_email: Option<String>,
    /// When true, HTTP-01 proofs are served by the built-in responder.
    pub public: bool,
    pub document_roots: Vec<PathBuf>,
    pub bind_address: SocketAddr,
    pub polling: PollingConfig,
    pub request_timeout: Duration,
    pub max_concurrent_authorizations: usize,
}

impl Default for IssuanceOptions {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            output_dir: PathBuf::from("le_certs"),
            key_size: DEFAULT_KEY_SIZE,
            endpoint: LETSENCRYPT_PRODUCTION.to_string(),
            account_email: String::new(),
            letsencrypt_account_email: None,
            support_email: DEFAULT_SUPPORT_EMAIL.to_string(),
            admin_notification_email: None,
            public: false,
            document_roots: Vec::new(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 80)),
            polling: PollingConfig::default(),
            request_timeout: Duration::from_secs(30),
            max_concurrent_authorizations: 4,
        }
    }
}

impl IssuanceOptions {
    /// Checks every option and returns the normalized domain set. Runs before any
    /// network activity.
    pub fn validate(&self) -> Result<DomainSet, ConfigurationError> {
        let domains = DomainSet::parse(&self.domains)?;

        if !SUPPORTED_KEY_SIZES.contains(&self.key_size) {
            return Err(ConfigurationError::KeySize(self.key_size));
        }
        validate_endpoint(&self.endpoint)?;
        validate_email("account_email", &self.account_email)?;
        validate_email("support_email", &self.support_email)?;
        if let Some(contact) = &self.letsencrypt_account_email {
            validate_email("letsencrypt_account_email", contact)?;
        }
        if let Some(admin) = &self.admin_notification_email {
            validate_email("admin_notification_email", admin)?;
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::OutputDir);
        }
        if !self.public && self.document_roots.is_empty() {
            return Err(ConfigurationError::NoDocumentRoots);
        }
        self.polling.validate()?;
        if self.max_concurrent_authorizations == 0 {
            return Err(ConfigurationError::Concurrency);
        }

        Ok(domains)
    }

    /// Contact address registered with the CA.
    pub fn registration_contact(&self) -> &str {
        self.letsencrypt_account_email
            .as_deref()
            .unwrap_or(&self.account_email)
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigurationError> {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') && !rest.contains(' ') => Ok(()),
        _ => Err(ConfigurationError::Endpoint(endpoint.to_string())),
    }
}

fn validate_email(field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    let invalid = || ConfigurationError::Email {
        field,
        value: value.to_string(),
    };
    let (local, host) = value.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || host.is_empty()
        || host.contains('@')
        || !host.contains('.')
        || value.chars().any(char::is_whitespace)
    {
        return Err(invalid());
    }
    Ok(())
}
