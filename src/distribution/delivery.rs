use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::core::types::{RunResult, RunSummary};
use crate::distribution::export::{CertificateWriter, WrittenCertificate};

/// Persists the outcome of a run: the PEM files of an issued certificate and,
/// when asked for, the JSON run report.
pub struct Delivery {
    writer: CertificateWriter,
    report: Option<PathBuf>,
}

impl Delivery {
    pub fn new(output_dir: impl Into<PathBuf>, report: Option<PathBuf>) -> Self {
        Self {
            writer: CertificateWriter::new(output_dir),
            report,
        }
    }

    /// The certificate is written before the report, and a report that
    /// cannot be written only costs a warning.
    pub fn deliver(&self, result: &RunResult) -> Result<Option<WrittenCertificate>> {
        let written = match result {
            Ok(report) => Some(
                self.writer
                    .write(report.domains.primary(), &report.certificate),
            ),
            Err(_) => None,
        };

        if let Some(path) = &self.report {
            match write_report(path, result) {
                Ok(()) => info!("[delivery] run report written to {}", path.display()),
                Err(err) => warn!("[delivery] run report not written: {:#}", err),
            }
        }

        written.transpose()
    }
}

fn write_report(path: &Path, result: &RunResult) -> Result<()> {
    let summary = RunSummary::from_result(result);
    let json = serde_json::to_vec_pretty(&summary).context("failed to serialize run report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(())
}
