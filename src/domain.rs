use std::fmt;

use thiserror::Error;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("at least one domain is required")]
    Empty,
    #[error("domain name is required")]
    Blank,
    #[error("invalid domain name {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("domain {0} is listed more than once")]
    Duplicate(String),
}

/// Normalizes a host name for issuance: trims, drops the trailing dot, converts
/// IDNs to their ASCII form and lowercases.
pub fn normalize_domain(input: &str) -> Result<String, DomainError> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DomainError::Blank);
    }
    let ascii = idna::domain_to_ascii(trimmed).map_err(|err| DomainError::Invalid {
        name: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    let ascii = ascii.to_lowercase();
    validate_host_name(&ascii)?;
    Ok(ascii)
}

fn validate_host_name(name: &str) -> Result<(), DomainError> {
    let invalid = |reason: &str| DomainError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 253 characters"));
    }
    if name.starts_with("*.") {
        return Err(invalid("wildcards cannot be validated over HTTP-01"));
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("a fully qualified name with at least two labels is required"));
    }
    for label in labels {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid("label contains characters outside [a-z0-9-]"));
        }
    }
    Ok(())
}

/// Ordered, unique, non-empty list of host names. The first entry becomes the
/// certificate's common name; all entries are subject alternative names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSet {
    names: Vec<String>,
}

impl DomainSet {
    pub fn parse<I, S>(domains: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = Vec::new();
        for raw in domains {
            let name = normalize_domain(raw.as_ref())?;
            if names.contains(&name) {
                return Err(DomainError::Duplicate(name));
            }
            names.push(name);
        }
        if names.is_empty() {
            return Err(DomainError::Empty);
        }
        Ok(Self { names })
    }

    pub fn primary(&self) -> &str {
        &self.names[0]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.names.iter()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<'a> IntoIterator for &'a DomainSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.iter()
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join(", "))
    }
}
