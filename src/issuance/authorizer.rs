use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::challenge::ChallengePublisher;
use crate::core::types::{
    AuthorizationOutcome, AuthorizationPhase, AuthorizationStatus, ChallengeKind,
};
use crate::issuance::account::Account;
use crate::issuance::directory::{AcmeDirectory, AuthorizationDetails, CaError};
use crate::issuance::error::AuthorizationFailure;
use crate::issuance::polling::{Attempt, PollError, PollPolicy, poll_until};

/// Drives one domain through HTTP-01 to a terminal state. The publication
/// mechanism (document root or built-in responder) is injected.
pub struct DomainAuthorizer {
    directory: Arc<dyn AcmeDirectory>,
    publisher: Arc<dyn ChallengePublisher>,
    account: Account,
    policy: PollPolicy,
    cleanup: TaskTracker,
}

struct Progress {
    outcome: AuthorizationOutcome,
    published: Option<PublishedProof>,
    /// Status checks made so far, readable after the drive is cut off.
    attempts: AtomicU32,
}

/// A challenge response that has been handed to the publisher. Withdrawn on
/// [`PublishedProof::withdraw`], or from a task on the cleanup tracker when
/// the authorization is dropped before it got there.
struct PublishedProof {
    publisher: Arc<dyn ChallengePublisher>,
    cleanup: TaskTracker,
    domain: String,
    token: Option<String>,
}

impl PublishedProof {
    async fn withdraw(mut self) {
        if let Some(token) = self.token.as_deref() {
            withdraw(self.publisher.as_ref(), &self.domain, token).await;
        }
        self.token = None;
    }
}

impl Drop for PublishedProof {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(
                "[authorize] runtime gone, challenge {} for {} left in place",
                token, self.domain
            );
            return;
        };
        debug!("[authorize] withdrawing abandoned challenge for {}", self.domain);
        let publisher = self.publisher.clone();
        let domain = std::mem::take(&mut self.domain);
        self.cleanup.spawn_on(
            async move { withdraw(publisher.as_ref(), &domain, &token).await },
            &handle,
        );
    }
}

async fn withdraw(publisher: &dyn ChallengePublisher, domain: &str, token: &str) {
    if let Err(err) = publisher.withdraw(domain, token).await {
        warn!("[authorize] failed to withdraw challenge for {}: {}", domain, err);
    }
}

impl DomainAuthorizer {
    pub fn new(
        directory: Arc<dyn AcmeDirectory>,
        publisher: Arc<dyn ChallengePublisher>,
        account: Account,
        policy: PollPolicy,
    ) -> Self {
        Self {
            directory,
            publisher,
            account,
            policy,
            cleanup: TaskTracker::new(),
        }
    }

    /// Tracker that receives the withdrawals of authorizations dropped
    /// mid-flight.
    pub fn with_cleanup(mut self, cleanup: TaskTracker) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Never fails as such: every problem is recorded in the outcome.
    pub async fn authorize(&self, domain: &str, authorization_url: &str) -> AuthorizationOutcome {
        let started = Instant::now();
        let mut progress = Progress {
            outcome: AuthorizationOutcome {
                domain: domain.to_string(),
                challenge: None,
                token: None,
                final_status: None,
                phase: AuthorizationPhase::Requested,
                error: None,
            },
            published: None,
            attempts: AtomicU32::new(0),
        };

        let driven = tokio::time::timeout(
            self.policy.timeout,
            self.drive(domain, authorization_url, started, &mut progress),
        )
        .await;
        match driven {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => progress.outcome.error = Some(failure),
            Err(_) => {
                progress.outcome.error = Some(AuthorizationFailure::ValidationTimeout {
                    attempts: progress.attempts.load(Ordering::Relaxed),
                    elapsed_ms: elapsed_ms(started.elapsed()),
                })
            }
        }

        if let Some(proof) = progress.published.take() {
            proof.withdraw().await;
        }

        match &progress.outcome.error {
            None => info!("[authorize] {} is valid", domain),
            Some(failure) => warn!("[authorize] {} failed: {}", domain, failure),
        }
        progress.outcome
    }

    async fn drive(
        &self,
        domain: &str,
        url: &str,
        started: Instant,
        progress: &mut Progress,
    ) -> Result<(), AuthorizationFailure> {
        let details = self
            .directory
            .authorization(&self.account, url)
            .await
            .map_err(ca_unavailable)?;
        progress.outcome.final_status = Some(details.status);
        if details.status.is_terminal() {
            info!(
                "[authorize] {} already {:?}, nothing to publish",
                domain, details.status
            );
            progress.outcome.phase = AuthorizationPhase::Finished;
            return terminal_result(&details);
        }

        let challenge = details
            .challenge(ChallengeKind::Http01)
            .cloned()
            .ok_or(AuthorizationFailure::ChallengeUnavailable)?;
        let key_authorization = self.account.key().key_authorization(&challenge.token);
        progress.outcome.challenge = Some(challenge.kind);
        progress.outcome.token = Some(challenge.token.clone());
        progress.outcome.phase = AuthorizationPhase::ChallengePrepared;

        // Recorded first so a partial publication is still cleaned up.
        progress.published = Some(PublishedProof {
            publisher: self.publisher.clone(),
            cleanup: self.cleanup.clone(),
            domain: domain.to_string(),
            token: Some(challenge.token.clone()),
        });
        self.publisher
            .publish(domain, &challenge.token, &key_authorization)
            .await
            .map_err(|e| AuthorizationFailure::PublicationFailed {
                detail: e.to_string(),
            })?;

        self.directory
            .notify_challenge_ready(&self.account, &challenge)
            .await
            .map_err(ca_unavailable)?;
        progress.outcome.phase = AuthorizationPhase::Notified;
        debug!("[authorize] notified CA for {}", domain);

        progress.outcome.phase = AuthorizationPhase::Polling;
        let policy = PollPolicy {
            timeout: self.policy.timeout.saturating_sub(started.elapsed()),
            ..self.policy.clone()
        };
        let directory = self.directory.as_ref();
        let account = &self.account;
        let attempts = &progress.attempts;
        let polled = poll_until(domain, &policy, move || async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            let details = directory.authorization_status(account, url).await?;
            Ok::<_, CaError>(if details.status.is_terminal() {
                Attempt::Done(details)
            } else {
                Attempt::Retry(details)
            })
        })
        .await;

        match polled {
            Ok(details) => {
                progress.outcome.final_status = Some(details.status);
                progress.outcome.phase = AuthorizationPhase::Finished;
                terminal_result(&details)
            }
            Err(PollError::Exhausted {
                last,
                attempts,
                elapsed,
            }) => {
                if let Some(last) = last {
                    progress.outcome.final_status = Some(last.status);
                }
                Err(AuthorizationFailure::ValidationTimeout {
                    attempts,
                    elapsed_ms: elapsed_ms(elapsed),
                })
            }
            Err(PollError::Failed(err)) => Err(ca_unavailable(err)),
        }
    }
}

fn terminal_result(details: &AuthorizationDetails) -> Result<(), AuthorizationFailure> {
    match details.status {
        AuthorizationStatus::Valid => Ok(()),
        AuthorizationStatus::Invalid => Err(AuthorizationFailure::ChallengeRejected {
            detail: details
                .error
                .clone()
                .unwrap_or_else(|| "authorization marked invalid".to_string()),
        }),
        AuthorizationStatus::Expired => Err(AuthorizationFailure::ValidationExpired),
        AuthorizationStatus::Pending | AuthorizationStatus::Processing => {
            Err(AuthorizationFailure::CaUnavailable {
                detail: format!("unexpected non-terminal status {:?}", details.status),
            })
        }
    }
}

fn ca_unavailable(err: CaError) -> AuthorizationFailure {
    AuthorizationFailure::CaUnavailable {
        detail: err.to_string(),
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
