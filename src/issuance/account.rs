use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use openssl::{
    error::ErrorStack,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// RSA sizes accepted for account and certificate keys.
pub const SUPPORTED_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("unsupported RSA key size {0}. Allowed: 2048, 3072, 4096")]
    UnsupportedSize(u32),
    #[error("account keys must be RSA keys")]
    NotRsa,
    #[error("key generation failed: {0}")]
    Generate(ErrorStack),
    #[error("failed to parse private key PEM: {0}")]
    Parse(ErrorStack),
    #[error("failed to serialize private key: {0}")]
    Serialize(String),
}

/// Generates an RSA private key and returns it as PKCS#8 PEM.
pub fn generate_rsa_key_pem(bits: u32) -> Result<Zeroizing<String>, KeyError> {
    let key = generate_rsa_pkey(bits)?;
    pkey_to_pem(&key)
}

fn generate_rsa_pkey(bits: u32) -> Result<PKey<Private>, KeyError> {
    if !SUPPORTED_KEY_SIZES.contains(&bits) {
        return Err(KeyError::UnsupportedSize(bits));
    }
    let rsa = Rsa::generate(bits).map_err(KeyError::Generate)?;
    PKey::from_rsa(rsa).map_err(KeyError::Generate)
}

fn pkey_to_pem(key: &PKey<Private>) -> Result<Zeroizing<String>, KeyError> {
    let pem = key
        .private_key_to_pem_pkcs8()
        .map_err(|e| KeyError::Serialize(e.to_string()))?;
    String::from_utf8(pem)
        .map(Zeroizing::new)
        .map_err(|_| KeyError::Serialize("key PEM contained invalid UTF-8".into()))
}

/// The operator's ACME account key. The CA derives the account identity from it,
/// so the same key always maps to the same account. Requests are signed by the
/// ACME client with [`AccountKey::private_key`].
#[derive(Clone)]
pub struct AccountKey {
    key: PKey<Private>,
    n: String,
    e: String,
}

impl AccountKey {
    pub fn generate(bits: u32) -> Result<Self, KeyError> {
        Self::from_pkey(generate_rsa_pkey(bits)?)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyError> {
        let key = PKey::private_key_from_pem(pem).map_err(KeyError::Parse)?;
        Self::from_pkey(key)
    }

    fn from_pkey(key: PKey<Private>) -> Result<Self, KeyError> {
        if key.id() != Id::RSA {
            return Err(KeyError::NotRsa);
        }
        let rsa = key.rsa().map_err(KeyError::Parse)?;
        let n = URL_SAFE_NO_PAD.encode(rsa.n().to_vec());
        let e = URL_SAFE_NO_PAD.encode(rsa.e().to_vec());
        Ok(Self { key, n, e })
    }

    pub fn to_pem(&self) -> Result<Zeroizing<String>, KeyError> {
        pkey_to_pem(&self.key)
    }

    pub fn bits(&self) -> u32 {
        self.key.bits()
    }

    pub(crate) fn private_key(&self) -> PKey<Private> {
        self.key.clone()
    }

    /// base64url(SHA-256) of the canonical JWK, members in RFC 7638 order.
    pub fn thumbprint(&self) -> String {
        let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, self.e, self.n);
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// HTTP-01 key authorization for `token`.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint())
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("bits", &self.bits())
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// A registered account: the key plus the account URL the CA assigned to it.
#[derive(Clone, Debug)]
pub struct Account {
    key: AccountKey,
    url: String,
}

impl Account {
    pub fn new(key: AccountKey, url: impl Into<String>) -> Self {
        Self {
            key,
            url: url.into(),
        }
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
