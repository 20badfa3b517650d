//! hostcert - request a certificate for a hosting account's domains and ask
//! support to install it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use hostcert::challenge::ChallengePublisher;
use hostcert::challenge::standalone::StandaloneResponder;
use hostcert::challenge::webroot::WebrootPublisher;
use hostcert::core::options::{
    DEFAULT_KEY_SIZE, DEFAULT_SUPPORT_EMAIL, IssuanceOptions, LETSENCRYPT_PRODUCTION,
    LETSENCRYPT_STAGING, PollingConfig,
};
use hostcert::distribution::delivery::Delivery;
use hostcert::distribution::export::write_secure_file;
use hostcert::distribution::notify::{
    Instructions, LogNotifier, Notification, Notifier, SendmailNotifier,
};
use hostcert::issuance::account::AccountKey;
use hostcert::issuance::flow::IssuanceOrchestrator;
use hostcert::issuance::http_directory::HttpAcmeDirectory;

/// Obtain a Let's Encrypt certificate for domains hosted on a shared account
#[derive(Parser, Debug)]
#[command(name = "hostcert")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Domains to include; the first one becomes the common name
    #[arg(long = "domains", env = "HOSTCERT_DOMAINS", value_delimiter = ',', required = true)]
    domains: Vec<String>,

    /// Directory the PEM files are written to
    #[arg(long = "output-dir", env = "HOSTCERT_OUTPUT_DIR", default_value = "le_certs")]
    output_dir: PathBuf,

    /// RSA key size in bits (2048, 3072 or 4096)
    #[arg(long = "key-size", env = "HOSTCERT_KEY_SIZE", default_value_t = DEFAULT_KEY_SIZE)]
    key_size: u32,

    /// ACME directory URL
    #[arg(long = "endpoint", env = "HOSTCERT_ENDPOINT", default_value = LETSENCRYPT_PRODUCTION)]
    endpoint: String,

    /// Use the Let's Encrypt staging directory
    #[arg(long = "staging", conflicts_with = "endpoint")]
    staging: bool,

    /// Hosting account owner, copied on the installation request
    #[arg(long = "account-email", env = "HOSTCERT_ACCOUNT_EMAIL")]
    account_email: String,

    /// Contact registered with the CA (defaults to --account-email)
    #[arg(long = "letsencrypt-account-email", env = "HOSTCERT_LETSENCRYPT_ACCOUNT_EMAIL")]
    letsencrypt_account_email: Option<String>,

    /// Where the installation request is sent
    #[arg(long = "support-email", env = "HOSTCERT_SUPPORT_EMAIL", default_value = DEFAULT_SUPPORT_EMAIL)]
    support_email: String,

    /// Receives a notice on success or failure
    #[arg(long = "admin-notification-email", env = "HOSTCERT_ADMIN_NOTIFICATION_EMAIL")]
    admin_notification_email: Option<String>,

    /// Serve challenges from a built-in HTTP responder instead of document roots
    #[arg(long = "public")]
    public: bool,

    /// Document root the challenge files are written into (repeatable)
    #[arg(long = "document-root", env = "HOSTCERT_DOCUMENT_ROOTS", value_delimiter = ',')]
    document_roots: Vec<PathBuf>,

    /// Listen address of the built-in responder
    #[arg(long = "bind", env = "HOSTCERT_BIND", default_value = "0.0.0.0:80")]
    bind_address: SocketAddr,

    /// PEM file holding the account key; created when missing
    #[arg(long = "account-key", env = "HOSTCERT_ACCOUNT_KEY")]
    account_key: Option<PathBuf>,

    /// Seconds between the first status checks
    #[arg(long = "poll-interval", default_value_t = 2)]
    poll_interval: u64,

    /// Upper bound in seconds for the backoff between checks
    #[arg(long = "max-poll-interval", default_value_t = 10)]
    max_poll_interval: u64,

    /// Status checks per authorization or order before giving up
    #[arg(long = "max-attempts", default_value_t = 60)]
    max_attempts: u32,

    /// Seconds allowed for each domain's validation
    #[arg(long = "validation-timeout", default_value_t = 180)]
    validation_timeout: u64,

    /// Seconds allowed for the CA to finish the order
    #[arg(long = "issuance-timeout", default_value_t = 180)]
    issuance_timeout: u64,

    /// Seconds allowed for a single request to the CA
    #[arg(long = "request-timeout", default_value_t = 30)]
    request_timeout: u64,

    /// Domains validated at the same time
    #[arg(long = "max-concurrent-authorizations", default_value_t = 4)]
    max_concurrent_authorizations: usize,

    /// Write a JSON summary of the run to this file
    #[arg(long = "report")]
    report: Option<PathBuf>,

    /// Log the notification mails instead of sending them
    #[arg(long = "no-email")]
    no_email: bool,

    /// sendmail binary used for notifications
    #[arg(long = "sendmail", env = "HOSTCERT_SENDMAIL", default_value = "sendmail")]
    sendmail: String,
}

impl Cli {
    fn options(&self) -> IssuanceOptions {
        IssuanceOptions {
            domains: self.domains.clone(),
            output_dir: self.output_dir.clone(),
            key_size: self.key_size,
            endpoint: if self.staging {
                LETSENCRYPT_STAGING.to_string()
            } else {
                self.endpoint.clone()
            },
            account_email: self.account_email.clone(),
            letsencrypt_account_email: self.letsencrypt_account_email.clone(),
            support_email: self.support_email.clone(),
            admin_notification_email: self.admin_notification_email.clone(),
            public: self.public,
            document_roots: self.document_roots.clone(),
            bind_address: self.bind_address,
            polling: PollingConfig {
                poll_interval: Duration::from_secs(self.poll_interval),
                max_poll_interval: Duration::from_secs(self.max_poll_interval),
                max_attempts: self.max_attempts,
                validation_timeout: Duration::from_secs(self.validation_timeout),
                issuance_timeout: Duration::from_secs(self.issuance_timeout),
            },
            request_timeout: Duration::from_secs(self.request_timeout),
            max_concurrent_authorizations: self.max_concurrent_authorizations,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let options = cli.options();
    let domains = options.validate().context("invalid options")?;

    let account_key = load_account_key(cli.account_key.as_deref(), options.key_size).await?;
    let publisher: Arc<dyn ChallengePublisher> = if options.public {
        Arc::new(
            StandaloneResponder::bind(options.bind_address)
                .await
                .context("failed to start HTTP-01 responder")?,
        )
    } else {
        Arc::new(WebrootPublisher::new(options.document_roots.clone()))
    };
    let directory = Arc::new(HttpAcmeDirectory::new(
        options.endpoint.clone(),
        options.request_timeout,
    ));
    let notifier: Box<dyn Notifier> = if cli.no_email {
        Box::new(LogNotifier)
    } else {
        Box::new(SendmailNotifier::new(cli.sendmail.clone()))
    };

    let orchestrator = IssuanceOrchestrator::new(options, account_key, directory, publisher);
    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, withdrawing published challenges");
            shutdown.cancel();
        }
    });
    let result = orchestrator.run().await;

    let options = orchestrator.options();
    let written = Delivery::new(&options.output_dir, cli.report.clone()).deliver(&result)?;
    let instructions = Instructions::new(
        &domains,
        &options.support_email,
        &options.account_email,
        options.admin_notification_email.as_deref(),
    );

    match result {
        Ok(report) => {
            let written =
                written.ok_or_else(|| anyhow!("certificate for {} was not written", domains))?;
            info!(
                "certificate for {} written to {}",
                domains,
                written.output_dir.display()
            );
            send(
                notifier.as_ref(),
                &instructions.installation_request(&report.certificate, &written),
            )
            .await;
            if let Some(notice) = instructions.success_notice(&report.certificate, &written) {
                send(notifier.as_ref(), &notice).await;
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(notice) = instructions.failure_notice(&failure) {
                send(notifier.as_ref(), &notice).await;
            }
            Err(failure.into())
        }
    }
}

async fn load_account_key(path: Option<&Path>, key_size: u32) -> Result<AccountKey> {
    if let Some(path) = path.filter(|path| path.exists()) {
        let pem = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read account key {}", path.display()))?;
        let key = AccountKey::from_pem(&pem)
            .with_context(|| format!("failed to load account key {}", path.display()))?;
        info!("loaded {}-bit account key from {}", key.bits(), path.display());
        return Ok(key);
    }

    let key = tokio::task::spawn_blocking(move || AccountKey::generate(key_size))
        .await
        .context("account key task failed")?
        .context("failed to generate account key")?;
    if let Some(path) = path {
        let pem = key.to_pem()?;
        write_secure_file(path, pem.as_bytes())?;
        info!("saved new account key to {}", path.display());
    }
    Ok(key)
}

async fn send(notifier: &dyn Notifier, notification: &Notification) {
    if let Err(err) = notifier.send(notification).await {
        error!("[notify] failed to send \"{}\": {:#}", notification.subject, err);
    }
}
