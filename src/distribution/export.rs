use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Component, Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::core::types::IssuedCertificate;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

pub const CERT_FILENAME: &str = "cert.pem";
pub const CHAIN_FILENAME: &str = "chain.pem";
pub const FULLCHAIN_FILENAME: &str = "fullchain.pem";
pub const PRIVKEY_FILENAME: &str = "privkey.pem";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WrittenFile {
    pub label: &'static str,
    pub path: PathBuf,
}

/// Where a run's PEM files ended up.
#[derive(Debug, Clone, Serialize)]
pub struct WrittenCertificate {
    pub output_dir: PathBuf,
    pub files: Vec<WrittenFile>,
}

impl WrittenCertificate {
    pub fn path(&self, label: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|file| file.label == label)
            .map(|file| file.path.as_path())
    }
}

/// Writes `<output_dir>/<primary domain>/{cert,chain,fullchain,privkey}.pem`.
/// Files from a previous run for the same primary domain are replaced.
/// Without intermediates there is no `chain.pem`.
pub struct CertificateWriter {
    output_dir: PathBuf,
}

impl CertificateWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn write(&self, primary: &str, certificate: &IssuedCertificate) -> Result<WrittenCertificate> {
        validate_folder_name(primary)?;
        let output_dir = self.output_dir.join(primary);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!(
                "failed to create certificate directory at {}",
                output_dir.display()
            )
        })?;

        let certificate_pem = certificate.certificate_pem();
        let chain_pem = certificate.chain_pem();
        let fullchain_pem = certificate.fullchain_pem();
        let mut contents = vec![("cert", CERT_FILENAME, certificate_pem.as_str())];
        if chain_pem.is_empty() {
            warn!(
                "[export] CA returned no intermediates for {}, skipping {}",
                primary, CHAIN_FILENAME
            );
            remove_stale(&output_dir.join(CHAIN_FILENAME))?;
        } else {
            contents.push(("chain", CHAIN_FILENAME, chain_pem.as_str()));
        }
        contents.push(("fullchain", FULLCHAIN_FILENAME, fullchain_pem.as_str()));
        contents.push(("privkey", PRIVKEY_FILENAME, certificate.private_key_pem()));

        let mut files = Vec::with_capacity(contents.len());
        for (label, filename, pem) in contents {
            let path = output_dir.join(filename);
            write_secure_file(&path, pem.as_bytes())?;
            files.push(WrittenFile { label, path });
        }

        info!(
            "[export] wrote certificate for {} to {}",
            primary,
            output_dir.display()
        );
        Ok(WrittenCertificate { output_dir, files })
    }
}

/// A chain left over from an earlier issuance would not match the new leaf.
fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("[export] removed stale {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn validate_folder_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("folder name cannot be empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("folder name must be a single path segment")),
    }
}

pub fn write_secure_file(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    ensure_permissions(path)?;
    Ok(())
}

fn ensure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let desired = fs::Permissions::from_mode(0o600);
        let metadata = fs::metadata(path)?;
        let current = metadata.permissions();
        // A pre-existing file keeps its old mode when reopened.
        if current.mode() & 0o777 != 0o600 {
            fs::set_permissions(path, desired).with_context(|| {
                format!(
                    "failed to set restrictive permissions on {}",
                    path.display()
                )
            })?;
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = fs::metadata(path) {
            warn!(
                "[export] warning: unable to confirm permissions for {}: {}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}
