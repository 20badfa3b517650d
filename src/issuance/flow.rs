use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::challenge::ChallengePublisher;
use crate::core::options::IssuanceOptions;
use crate::core::types::{AuthorizationOutcome, AuthorizationPhase, RunFailure, RunReport, RunResult};
use crate::domain::DomainSet;
use crate::issuance::account::{Account, AccountKey};
use crate::issuance::authorizer::DomainAuthorizer;
use crate::issuance::directory::{AcmeDirectory, CaError, OrderHandle};
use crate::issuance::error::{
    AuthorizationError, AuthorizationFailure, CertificateFailure, IssuanceError,
};
use crate::issuance::issuer::CertificateIssuer;
use crate::issuance::registrar::AccountRegistrar;

/// Runs one issuance end to end: validate, register, order, authorize every
/// domain, issue. Writing files and sending mail are left to the caller.
pub struct IssuanceOrchestrator {
    options: IssuanceOptions,
    account_key: AccountKey,
    directory: Arc<dyn AcmeDirectory>,
    publisher: Arc<dyn ChallengePublisher>,
    cleanup: TaskTracker,
    shutdown: CancellationToken,
}

impl IssuanceOrchestrator {
    pub fn new(
        options: IssuanceOptions,
        account_key: AccountKey,
        directory: Arc<dyn AcmeDirectory>,
        publisher: Arc<dyn ChallengePublisher>,
    ) -> Self {
        Self {
            options,
            account_key,
            directory,
            publisher,
            cleanup: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops a running [`run`](Self::run), which then
    /// returns [`IssuanceError::Interrupted`] once published proofs are gone.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn options(&self) -> &IssuanceOptions {
        &self.options
    }

    /// Dropping the returned future aborts any authorization still running;
    /// their proofs are withdrawn in the background, see
    /// [`wait_for_withdrawals`](Self::wait_for_withdrawals).
    pub async fn run(&self) -> RunResult {
        let result = tokio::select! {
            result = self.issue() => result,
            _ = self.shutdown.cancelled() => {
                warn!("[issuance] interrupted, abandoning the order");
                Err(RunFailure::new(IssuanceError::Interrupted))
            }
        };
        self.wait_for_withdrawals().await;
        result
    }

    /// Resolves once every challenge proof left behind by an aborted
    /// authorization has been withdrawn.
    pub async fn wait_for_withdrawals(&self) {
        self.cleanup.close();
        if !self.cleanup.is_empty() {
            debug!("[issuance] waiting for {} withdrawals", self.cleanup.len());
        }
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }

    async fn issue(&self) -> RunResult {
        let domains = self.options.validate().map_err(RunFailure::new)?;
        info!("[issuance] requesting certificate for {}", domains);

        let registration = AccountRegistrar::new(self.directory.clone())
            .register(&self.account_key, self.options.registration_contact())
            .await
            .map_err(RunFailure::new)?;
        let account = registration.account;

        let order = self
            .directory
            .new_order(&account, &domains)
            .await
            .map_err(|e| {
                warn!("[issuance] order for {} not created: {}", domains, e);
                RunFailure::new(match e {
                    CaError::Rejected { detail, .. } => CertificateFailure::OrderRejected(detail),
                    other => {
                        CertificateFailure::CaUnavailable(format!("order creation failed: {other}"))
                    }
                })
            })?;

        let authorizations = self.authorize_all(&domains, &account, &order).await;
        if let Some(failed) = authorizations.iter().find(|outcome| !outcome.is_valid()) {
            let failure = failed
                .error
                .clone()
                .unwrap_or(AuthorizationFailure::CaUnavailable {
                    detail: "authorization did not reach a valid state".into(),
                });
            let error = AuthorizationError {
                domain: failed.domain.clone(),
                failure,
            };
            warn!("[issuance] {}", error);
            return Err(RunFailure::new(error).with_authorizations(authorizations));
        }

        let certificate = CertificateIssuer::new(
            self.directory.clone(),
            self.options.key_size,
            self.options.polling.issuance_policy(),
        )
        .issue(&domains, &account, &order)
        .await
        .map_err(|e| RunFailure::new(e).with_authorizations(authorizations.clone()))?;

        Ok(RunReport {
            domains,
            certificate,
            authorizations,
            account_created: registration.created,
        })
    }

    /// Authorizes every domain on a bounded pool and returns the outcomes in
    /// domain order.
    async fn authorize_all(
        &self,
        domains: &DomainSet,
        account: &Account,
        order: &OrderHandle,
    ) -> Vec<AuthorizationOutcome> {
        let authorizer = Arc::new(
            DomainAuthorizer::new(
                self.directory.clone(),
                self.publisher.clone(),
                account.clone(),
                self.options.polling.validation_policy(),
            )
            .with_cleanup(self.cleanup.clone()),
        );
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_authorizations));
        let mut outcomes: Vec<Option<AuthorizationOutcome>> = vec![None; domains.len()];
        let mut tasks = JoinSet::new();

        for (index, domain) in domains.iter().enumerate() {
            let Some(url) = order.authorization_url(domain) else {
                outcomes[index] = Some(unfinished(
                    domain,
                    "order carries no authorization for this domain",
                ));
                continue;
            };
            let url = url.to_string();
            let domain = domain.clone();
            let authorizer = authorizer.clone();
            let permits = permits.clone();
            // Tracked so an aborted task counts until its proof is handed off.
            tasks.spawn(self.cleanup.track_future(async move {
                let _permit = permits.acquire_owned().await;
                (index, authorizer.authorize(&domain, &url).await)
            }));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) => warn!("[issuance] authorization task failed: {}", err),
            }
        }

        outcomes
            .into_iter()
            .zip(domains.iter())
            .map(|(outcome, domain)| {
                outcome.unwrap_or_else(|| unfinished(domain, "authorization task did not finish"))
            })
            .collect()
    }
}

fn unfinished(domain: &str, detail: &str) -> AuthorizationOutcome {
    AuthorizationOutcome {
        domain: domain.to_string(),
        challenge: None,
        token: None,
        final_status: None,
        phase: AuthorizationPhase::Requested,
        error: Some(AuthorizationFailure::CaUnavailable {
            detail: detail.to_string(),
        }),
    }
}
