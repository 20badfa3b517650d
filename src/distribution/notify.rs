use std::fmt::Write as _;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::types::{IssuedCertificate, RunFailure};
use crate::distribution::export::WrittenCertificate;
use crate::domain::DomainSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub to: String,
    pub cc: Option<String>,
    pub reply_to: Option<String>,
}

impl Notification {
    /// RFC 5322 message text, suitable for `sendmail -t`.
    pub fn to_message(&self) -> String {
        let mut message = String::new();
        let _ = writeln!(message, "To: {}", self.to);
        if let Some(cc) = &self.cc {
            let _ = writeln!(message, "Cc: {cc}");
        }
        if let Some(reply_to) = &self.reply_to {
            let _ = writeln!(message, "Reply-To: {reply_to}");
        }
        let _ = writeln!(message, "Subject: {}", self.subject);
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(&self.body);
        if !message.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Hands the message to the local MTA.
pub struct SendmailNotifier {
    program: String,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SendmailNotifier {
    fn default() -> Self {
        Self::new("sendmail")
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        // A sendmail that exits early closes the pipe; its exit status is the
        // more useful error.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(notification.to_message().as_bytes()).await,
            None => Ok(()),
        };

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for sendmail")?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        written.context("failed to write message to sendmail")?;
        info!("[notify] sent \"{}\" to {}", notification.subject, notification.to);
        Ok(())
    }
}

/// Writes notifications to the log instead of mailing them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            "[notify] would send \"{}\" to {}\n{}",
            notification.subject,
            notification.to,
            notification.body
        );
        Ok(())
    }
}

/// Renders the mails that follow a run.
pub struct Instructions<'a> {
    domains: &'a DomainSet,
    support_email: &'a str,
    account_email: &'a str,
    admin_email: Option<&'a str>,
}

impl<'a> Instructions<'a> {
    pub fn new(
        domains: &'a DomainSet,
        support_email: &'a str,
        account_email: &'a str,
        admin_email: Option<&'a str>,
    ) -> Self {
        Self {
            domains,
            support_email,
            account_email,
            admin_email,
        }
    }

    /// Asks support to install the new certificate; the account owner is copied.
    pub fn installation_request(
        &self,
        certificate: &IssuedCertificate,
        written: &WrittenCertificate,
    ) -> Notification {
        let mut body = String::new();
        let _ = writeln!(
            body,
            "Please apply the new certificate for {}.",
            self.domains
        );
        let _ = writeln!(body);
        for file in &written.files {
            let _ = writeln!(body, "  {}: {}", file.label, file.path.display());
        }
        let _ = writeln!(body);
        let _ = writeln!(body, "Expires: {}", certificate.not_after().to_rfc3339());
        let _ = writeln!(body, "SHA-256 fingerprint: {}", certificate.fingerprint());
        let _ = writeln!(body);
        let _ = writeln!(body, "Thank you!");

        Notification {
            subject: format!("Please install certificate for {}", self.domains.primary()),
            body,
            to: self.support_email.to_string(),
            cc: Some(self.account_email.to_string()),
            reply_to: Some(self.account_email.to_string()),
        }
    }

    pub fn success_notice(
        &self,
        certificate: &IssuedCertificate,
        written: &WrittenCertificate,
    ) -> Option<Notification> {
        let admin = self.admin_email?;
        let mut body = String::new();
        let _ = writeln!(body, "A certificate was issued for {}.", self.domains);
        let _ = writeln!(body, "Files: {}", written.output_dir.display());
        let _ = writeln!(body, "Expires: {}", certificate.not_after().to_rfc3339());
        let _ = writeln!(
            body,
            "Installation was requested from {}.",
            self.support_email
        );
        Some(Notification {
            subject: format!("Certificate issued for {}", self.domains.primary()),
            body,
            to: admin.to_string(),
            cc: None,
            reply_to: None,
        })
    }

    pub fn failure_notice(&self, failure: &RunFailure) -> Option<Notification> {
        let admin = self.admin_email?;
        let mut body = String::new();
        let _ = writeln!(body, "Certificate issuance for {} failed.", self.domains);
        let _ = writeln!(body);
        let _ = writeln!(body, "Error: {}", failure.error);
        for outcome in &failure.authorizations {
            match &outcome.error {
                Some(err) => {
                    let _ = writeln!(body, "  {}: {}", outcome.domain, err);
                }
                None => {
                    let _ = writeln!(body, "  {}: valid", outcome.domain);
                }
            }
        }
        Some(Notification {
            subject: format!("Certificate issuance failed for {}", self.domains.primary()),
            body,
            to: admin.to_string(),
            cc: None,
            reply_to: None,
        })
    }
}
