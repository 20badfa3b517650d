use std::fmt;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain::DomainSet;
use crate::issuance::account::{KeyError, generate_rsa_key_pem};

#[derive(Error, Debug)]
pub enum CsrError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("failed to load certificate key: {0}")]
    LoadKey(rcgen::Error),
    #[error("failed to build CSR: {0}")]
    Build(rcgen::Error),
}

/// Private key of the issued certificate. Independent of the account key.
pub struct CertificateKey {
    pem: Zeroizing<String>,
}

impl CertificateKey {
    pub fn generate(bits: u32) -> Result<Self, CsrError> {
        Ok(Self {
            pem: generate_rsa_key_pem(bits)?,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn into_pem(self) -> Zeroizing<String> {
        self.pem
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateKey(..)")
    }
}

/// DER-encoded PKCS#10 request: CN is the primary domain, SANs are every domain
/// in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
}

impl CertificateRequest {
    pub fn build(domains: &DomainSet, key: &CertificateKey) -> Result<Self, CsrError> {
        let key_pair = KeyPair::from_pem(key.pem()).map_err(CsrError::LoadKey)?;

        let mut params =
            CertificateParams::new(domains.as_slice().to_vec()).map_err(CsrError::Build)?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domains.primary());

        let csr = params
            .serialize_request(&key_pair)
            .map_err(CsrError::Build)?;
        let der: &[u8] = csr.der();
        Ok(Self { der: der.to_vec() })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}
