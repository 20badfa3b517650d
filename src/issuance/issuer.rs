use std::sync::Arc;

use log::{info, warn};

use crate::core::types::IssuedCertificate;
use crate::domain::DomainSet;
use crate::issuance::account::Account;
use crate::issuance::csr::{CertificateKey, CertificateRequest};
use crate::issuance::directory::{AcmeDirectory, CaError, OrderHandle, OrderState, OrderStatus};
use crate::issuance::error::{CertificateFailure, IssuanceError};
use crate::issuance::polling::{Attempt, PollError, PollPolicy, poll_until};

/// Turns a fully authorized order into a certificate.
pub struct CertificateIssuer {
    directory: Arc<dyn AcmeDirectory>,
    key_size: u32,
    policy: PollPolicy,
}

impl CertificateIssuer {
    pub fn new(directory: Arc<dyn AcmeDirectory>, key_size: u32, policy: PollPolicy) -> Self {
        Self {
            directory,
            key_size,
            policy,
        }
    }

    /// Every domain of `order` must already be authorized.
    pub async fn issue(
        &self,
        domains: &DomainSet,
        account: &Account,
        order: &OrderHandle,
    ) -> Result<IssuedCertificate, IssuanceError> {
        let key_size = self.key_size;
        let domains_for_csr = domains.clone();
        let (key, csr) = tokio::task::spawn_blocking(move || {
            let key = CertificateKey::generate(key_size)?;
            let csr = CertificateRequest::build(&domains_for_csr, &key)?;
            Ok::<_, crate::issuance::csr::CsrError>((key, csr))
        })
        .await
        .map_err(|e| CertificateFailure::CsrRejected(format!("CSR task failed: {e}")))?
        .map_err(|e| CertificateFailure::CsrRejected(e.to_string()))?;
        info!("[issuer] submitting CSR for {}", domains);

        let submitted = self
            .directory
            .submit_csr(account, order, csr.der())
            .await
            .map_err(|e| match e {
                CaError::Rejected { detail, .. } => CertificateFailure::CsrRejected(detail),
                other => CertificateFailure::CaUnavailable(other.to_string()),
            })?;

        let finished = if is_settled(&submitted) {
            submitted
        } else {
            self.await_order(account, order).await?
        };

        if finished.status == OrderStatus::Invalid {
            let detail = finished
                .error
                .unwrap_or_else(|| "order became invalid".to_string());
            warn!("[issuer] order {} invalid: {}", order.url, detail);
            return Err(CertificateFailure::CsrRejected(detail).into());
        }
        let certificate_url = finished.certificate_url.ok_or_else(|| {
            CertificateFailure::RetrievalFailed("valid order carries no certificate URL".into())
        })?;

        let chain = self
            .directory
            .fetch_certificate(account, &certificate_url)
            .await
            .map_err(|e| CertificateFailure::RetrievalFailed(e.to_string()))?;
        let issued = IssuedCertificate::from_pem_chain(&chain, key.into_pem())
            .map_err(|e| CertificateFailure::RetrievalFailed(e.to_string()))?;

        let missing: Vec<&str> = domains
            .iter()
            .filter(|domain| !issued.subject_alt_names().contains(*domain))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(CertificateFailure::RetrievalFailed(format!(
                "issued certificate does not cover {}",
                missing.join(", ")
            ))
            .into());
        }

        info!(
            "[issuer] certificate for {} issued, expires {}",
            domains,
            issued.not_after()
        );
        Ok(issued)
    }

    async fn await_order(
        &self,
        account: &Account,
        order: &OrderHandle,
    ) -> Result<OrderState, CertificateFailure> {
        let directory = self.directory.as_ref();
        let polled = poll_until(&order.url, &self.policy, move || async move {
            let state = directory.order_status(account, order).await?;
            Ok::<_, CaError>(if is_settled(&state) {
                Attempt::Done(state)
            } else {
                Attempt::Retry(state)
            })
        })
        .await;

        match polled {
            Ok(state) => Ok(state),
            Err(PollError::Exhausted {
                attempts, elapsed, ..
            }) => Err(CertificateFailure::CaUnavailable(format!(
                "order not completed after {} checks in {}s",
                attempts,
                elapsed.as_secs()
            ))),
            Err(PollError::Failed(err)) => Err(CertificateFailure::CaUnavailable(err.to_string())),
        }
    }
}

fn is_settled(state: &OrderState) -> bool {
    match state.status {
        OrderStatus::Valid => state.certificate_url.is_some(),
        OrderStatus::Invalid => true,
        OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => false,
    }
}
