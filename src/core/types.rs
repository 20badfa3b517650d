use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::{extensions::GeneralName, parse_x509_certificate};
use zeroize::Zeroizing;

use crate::domain::DomainSet;
use crate::issuance::error::{AuthorizationFailure, IssuanceError};

/// Status of one authorization as reported by the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Expired,
}

impl AuthorizationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid | Self::Expired)
    }
}

/// Where the per-domain workflow stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationPhase {
    Requested,
    ChallengePrepared,
    Notified,
    Polling,
    Finished,
}

/// Challenge types a CA may offer. Only `Http01` is ever answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeKind {
    pub fn from_acme(value: &str) -> Option<Self> {
        match value {
            "http-01" => Some(Self::Http01),
            "dns-01" => Some(Self::Dns01),
            "tls-alpn-01" => Some(Self::TlsAlpn01),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one domain during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationOutcome {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Last status seen from the CA, if it answered at all.
    pub final_status: Option<AuthorizationStatus>,
    pub phase: AuthorizationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AuthorizationFailure>,
}

impl AuthorizationOutcome {
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.final_status == Some(AuthorizationStatus::Valid)
    }
}

#[derive(Error, Debug)]
pub enum CertificateParseError {
    #[error("failed to parse PEM chain: {0}")]
    Pem(String),
    #[error("PEM chain contains no certificate")]
    NoCertificate,
    #[error("failed to parse leaf certificate: {0}")]
    X509(String),
}

/// The issued leaf, its intermediates and the certificate private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    leaf_der: Vec<u8>,
    chain_der: Vec<Vec<u8>>,
    private_key_pem: Zeroizing<String>,
    common_name: Option<String>,
    subject_alt_names: Vec<String>,
    not_after: DateTime<Utc>,
    fingerprint: String,
}

impl IssuedCertificate {
    /// Splits a CA-provided PEM bundle (leaf first) and reads the leaf's names,
    /// expiry and fingerprint.
    pub fn from_pem_chain(
        pem_chain: &str,
        private_key_pem: Zeroizing<String>,
    ) -> Result<Self, CertificateParseError> {
        let blocks =
            pem::parse_many(pem_chain).map_err(|e| CertificateParseError::Pem(e.to_string()))?;
        let mut certs = blocks
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.into_contents());
        let leaf_der = certs.next().ok_or(CertificateParseError::NoCertificate)?;
        let chain_der: Vec<Vec<u8>> = certs.collect();

        let (_, cert) = parse_x509_certificate(&leaf_der)
            .map_err(|e| CertificateParseError::X509(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let subject_alt_names = match cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(CertificateParseError::X509(e.to_string())),
        };
        let not_after = Utc
            .timestamp_opt(cert.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| CertificateParseError::X509("expiry out of range".into()))?;
        let fingerprint = {
            let mut hasher = Sha256::new();
            hasher.update(&leaf_der);
            hex::encode(hasher.finalize())
        };

        Ok(Self {
            leaf_der,
            chain_der,
            private_key_pem,
            common_name,
            subject_alt_names,
            not_after,
            fingerprint,
        })
    }

    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    pub fn certificate_pem(&self) -> String {
        encode_certificate(&self.leaf_der)
    }

    /// Intermediates only, in CA order.
    pub fn chain_pem(&self) -> String {
        self.chain_der
            .iter()
            .map(|der| encode_certificate(der))
            .collect()
    }

    /// Leaf followed by the intermediates.
    pub fn fullchain_pem(&self) -> String {
        let mut pem = self.certificate_pem();
        pem.push_str(&self.chain_pem());
        pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Hex SHA-256 of the leaf DER.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("common_name", &self.common_name)
            .field("subject_alt_names", &self.subject_alt_names)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .field("intermediates", &self.chain_der.len())
            .finish()
    }
}

fn encode_certificate(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

/// Successful run.
#[derive(Debug)]
pub struct RunReport {
    pub domains: DomainSet,
    pub certificate: IssuedCertificate,
    pub authorizations: Vec<AuthorizationOutcome>,
    pub account_created: bool,
}

/// Failed run: the fatal error plus whatever per-domain outcomes were gathered.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: IssuanceError,
    pub authorizations: Vec<AuthorizationOutcome>,
}

impl RunFailure {
    pub fn new(error: impl Into<IssuanceError>) -> Self {
        Self {
            error: error.into(),
            authorizations: Vec::new(),
        }
    }

    pub fn with_authorizations(mut self, authorizations: Vec<AuthorizationOutcome>) -> Self {
        self.authorizations = authorizations;
        self
    }
}

pub type RunResult = Result<RunReport, RunFailure>;

/// JSON summary of a run written by `--report`.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub success: bool,
    pub domains: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub authorizations: &'a [AuthorizationOutcome],
}

impl<'a> RunSummary<'a> {
    pub fn from_result(result: &'a RunResult) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                domains: report.domains.iter().map(String::as_str).collect(),
                not_after: Some(report.certificate.not_after()),
                fingerprint: Some(report.certificate.fingerprint()),
                account_created: Some(report.account_created),
                error: None,
                authorizations: &report.authorizations,
            },
            Err(failure) => Self {
                success: false,
                domains: failure
                    .authorizations
                    .iter()
                    .map(|outcome| outcome.domain.as_str())
                    .collect(),
                not_after: None,
                fingerprint: None,
                account_created: None,
                error: Some(failure.error.to_string()),
                authorizations: &failure.authorizations,
            },
        }
    }
}
