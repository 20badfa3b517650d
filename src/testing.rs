//! Scripted CA and recording publisher used by the workflow tests.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::challenge::{ChallengePublisher, PublishError};
use crate::core::types::{AuthorizationStatus, ChallengeKind};
use crate::domain::DomainSet;
use crate::issuance::account::{Account, AccountKey};
use crate::issuance::directory::{
    AcmeDirectory, AuthorizationDetails, CaError, ChallengeDetails, NewAccount, OrderHandle,
    OrderState, OrderStatus, PROBLEM_USER_ACTION_REQUIRED,
};
use crate::issuance::polling::PollPolicy;

pub const BASE_URL: &str = "https://ca.test";
pub const ACCOUNT_URL: &str = "https://ca.test/acct/1";
const ORDER_URL: &str = "https://ca.test/order/1";
const CERT_URL: &str = "https://ca.test/cert/1";

pub fn test_account_key() -> AccountKey {
    static KEY: OnceLock<AccountKey> = OnceLock::new();
    KEY.get_or_init(|| AccountKey::generate(2048).expect("account key"))
        .clone()
}

pub fn registered_account() -> Account {
    Account::new(test_account_key(), ACCOUNT_URL)
}

pub fn fast_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        max_attempts: 20,
        timeout: Duration::from_secs(2),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RegisterBehavior {
    Create,
    Existing,
    AlreadyExists,
    Reject,
    RequireAgreement,
}

#[derive(Debug, Clone, Copy)]
pub enum TermsBehavior {
    Accept,
    Refuse,
}

#[derive(Debug, Clone, Copy)]
pub enum OrderBehavior {
    /// Finalize answers `valid` with a certificate URL.
    Immediate,
    /// Order polls report `processing` until the n-th check.
    ProcessingFor(u32),
    RejectCsr,
    BecomesInvalid,
    NeverCompletes,
    DownloadFails,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub register: u32,
    pub lookup_account: u32,
    pub agree_to_terms: u32,
    pub new_order: u32,
    pub authorization: u32,
    pub notify: u32,
    pub authorization_status: u32,
    pub submit_csr: u32,
    pub order_status: u32,
    pub fetch_certificate: u32,
}

impl CallCounts {
    pub fn total(&self) -> u32 {
        self.register
            + self.lookup_account
            + self.agree_to_terms
            + self.new_order
            + self.authorization
            + self.notify
            + self.authorization_status
            + self.submit_csr
            + self.order_status
            + self.fetch_certificate
    }
}

#[derive(Debug, Clone)]
struct DomainScript {
    initial: AuthorizationStatus,
    statuses: Vec<AuthorizationStatus>,
    polled: usize,
    offers_http: bool,
    status_transport_error: bool,
    /// Status checks after this many never answer.
    hang_after: Option<usize>,
}

impl Default for DomainScript {
    fn default() -> Self {
        Self {
            initial: AuthorizationStatus::Pending,
            statuses: vec![AuthorizationStatus::Valid],
            polled: 0,
            offers_http: true,
            status_transport_error: false,
            hang_after: None,
        }
    }
}

#[derive(Default)]
struct State {
    calls: CallCounts,
    contacts: Vec<String>,
    scripts: HashMap<String, DomainScript>,
    csr: Option<Vec<u8>>,
    in_flight_notifies: usize,
}

/// In-process CA. Per-domain status sequences are replayed in order, the last
/// entry repeating; issued certificates carry the CN and SANs of the CSR.
pub struct FakeDirectory {
    register: RegisterBehavior,
    terms: TermsBehavior,
    order: OrderBehavior,
    hanging_notify: bool,
    order_rejected: bool,
    state: Mutex<State>,
    ca_key: KeyPair,
    ca_cert: Certificate,
}

impl FakeDirectory {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().expect("ca key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "Fake Intermediate");
        let ca_cert = params.self_signed(&ca_key).expect("ca cert");

        Self {
            register: RegisterBehavior::Create,
            terms: TermsBehavior::Accept,
            order: OrderBehavior::Immediate,
            hanging_notify: false,
            order_rejected: false,
            state: Mutex::new(State::default()),
            ca_key,
            ca_cert,
        }
    }

    pub fn with_register(mut self, behavior: RegisterBehavior) -> Self {
        self.register = behavior;
        self
    }

    pub fn with_terms(mut self, behavior: TermsBehavior) -> Self {
        self.terms = behavior;
        self
    }

    pub fn with_order(mut self, behavior: OrderBehavior) -> Self {
        self.order = behavior;
        self
    }

    pub fn with_hanging_notify(mut self) -> Self {
        self.hanging_notify = true;
        self
    }

    /// newOrder answers with a rateLimited problem.
    pub fn with_order_rejected(mut self) -> Self {
        self.order_rejected = true;
        self
    }

    pub fn with_statuses<I>(self, domain: &str, statuses: I) -> Self
    where
        I: IntoIterator<Item = AuthorizationStatus>,
    {
        let statuses: Vec<_> = statuses.into_iter().collect();
        self.script(domain, |script| script.statuses = statuses)
    }

    pub fn with_initial_status(self, domain: &str, status: AuthorizationStatus) -> Self {
        self.script(domain, |script| script.initial = status)
    }

    pub fn without_http_challenge(self, domain: &str) -> Self {
        self.script(domain, |script| script.offers_http = false)
    }

    pub fn with_status_transport_error(self, domain: &str) -> Self {
        self.script(domain, |script| script.status_transport_error = true)
    }

    pub fn with_status_hang_after(self, domain: &str, answered: usize) -> Self {
        self.script(domain, |script| script.hang_after = Some(answered))
    }

    fn script(self, domain: &str, edit: impl FnOnce(&mut DomainScript)) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            edit(state.scripts.entry(domain.to_string()).or_default());
        }
        self
    }

    pub fn authorization_url(&self, domain: &str) -> String {
        format!("{BASE_URL}/authz/{domain}")
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls
    }

    pub fn contacts(&self) -> Vec<String> {
        self.state.lock().unwrap().contacts.clone()
    }

    pub fn submitted_csr(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().csr.clone()
    }

    pub fn in_flight_notifies(&self) -> usize {
        self.state.lock().unwrap().in_flight_notifies
    }

    fn domain_of(url: &str) -> Result<String, CaError> {
        url.strip_prefix(&format!("{BASE_URL}/authz/"))
            .map(str::to_string)
            .ok_or_else(|| CaError::Protocol(format!("unknown authorization {url}")))
    }

    fn token_for(domain: &str) -> String {
        format!("{}-tok", domain.replace('.', "_"))
    }

    fn details(domain: &str, script: &DomainScript, status: AuthorizationStatus) -> AuthorizationDetails {
        let mut challenges = vec![ChallengeDetails {
            kind: ChallengeKind::Dns01,
            url: format!("{BASE_URL}/chall/{domain}/dns"),
            token: Self::token_for(domain),
        }];
        if script.offers_http {
            challenges.push(ChallengeDetails {
                kind: ChallengeKind::Http01,
                url: format!("{BASE_URL}/chall/{domain}/http"),
                token: Self::token_for(domain),
            });
        }
        AuthorizationDetails {
            domain: domain.to_string(),
            status,
            challenges,
            error: (status == AuthorizationStatus::Invalid)
                .then(|| format!("fake CA could not fetch the proof for {domain}")),
        }
    }

    fn sign_csr(&self, csr_der: &[u8]) -> Result<String, CaError> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| CaError::Protocol(format!("bad CSR: {e}")))?;
        let common_name = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let mut names = Vec::new();
        if let Some(extensions) = csr.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    for name in &san.general_names {
                        if let GeneralName::DNSName(dns) = name {
                            names.push(dns.to_string());
                        }
                    }
                }
            }
        }

        let mut params =
            CertificateParams::new(names).map_err(|e| CaError::Protocol(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        if let Some(cn) = common_name {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        let leaf_key = KeyPair::generate().map_err(|e| CaError::Protocol(e.to_string()))?;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| CaError::Protocol(e.to_string()))?;
        Ok(format!("{}{}", leaf.pem(), self.ca_cert.pem()))
    }
}

struct NotifyGuard<'a>(&'a Mutex<State>);

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.in_flight_notifies -= 1;
        }
    }
}

#[async_trait]
impl AcmeDirectory for FakeDirectory {
    async fn register_account(
        &self,
        _key: &AccountKey,
        contact: &[String],
    ) -> Result<NewAccount, CaError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.register += 1;
            state.contacts = contact.to_vec();
        }
        match self.register {
            RegisterBehavior::Create => Ok(NewAccount {
                url: ACCOUNT_URL.into(),
                created: true,
            }),
            RegisterBehavior::Existing => Ok(NewAccount {
                url: ACCOUNT_URL.into(),
                created: false,
            }),
            RegisterBehavior::AlreadyExists => Err(CaError::AccountExists),
            RegisterBehavior::Reject => Err(CaError::Rejected {
                problem_type: "urn:ietf:params:acme:error:invalidContact".into(),
                detail: "contact domain is not accepted".into(),
            }),
            RegisterBehavior::RequireAgreement => Err(CaError::Rejected {
                problem_type: PROBLEM_USER_ACTION_REQUIRED.into(),
                detail: "agree to the new terms first".into(),
            }),
        }
    }

    async fn lookup_account(&self, _key: &AccountKey) -> Result<String, CaError> {
        self.state.lock().unwrap().calls.lookup_account += 1;
        Ok(ACCOUNT_URL.into())
    }

    async fn agree_to_terms(&self, _account: &Account) -> Result<(), CaError> {
        self.state.lock().unwrap().calls.agree_to_terms += 1;
        match self.terms {
            TermsBehavior::Accept => Ok(()),
            TermsBehavior::Refuse => Err(CaError::Rejected {
                problem_type: PROBLEM_USER_ACTION_REQUIRED.into(),
                detail: "terms of service were not accepted".into(),
            }),
        }
    }

    async fn new_order(
        &self,
        _account: &Account,
        domains: &DomainSet,
    ) -> Result<OrderHandle, CaError> {
        self.state.lock().unwrap().calls.new_order += 1;
        if self.order_rejected {
            return Err(CaError::Rejected {
                problem_type: "urn:ietf:params:acme:error:rateLimited".into(),
                detail: "too many certificates already issued for example.com".into(),
            });
        }
        Ok(OrderHandle {
            url: ORDER_URL.into(),
            finalize_url: format!("{ORDER_URL}/finalize"),
            authorizations: domains
                .iter()
                .map(|domain| (domain.clone(), self.authorization_url(domain)))
                .collect(),
        })
    }

    async fn authorization(
        &self,
        _account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError> {
        let domain = Self::domain_of(url)?;
        let mut state = self.state.lock().unwrap();
        state.calls.authorization += 1;
        let script = state.scripts.entry(domain.clone()).or_default().clone();
        Ok(Self::details(&domain, &script, script.initial))
    }

    async fn notify_challenge_ready(
        &self,
        _account: &Account,
        _challenge: &ChallengeDetails,
    ) -> Result<(), CaError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.notify += 1;
            if self.hanging_notify {
                state.in_flight_notifies += 1;
            }
        }
        if self.hanging_notify {
            let _guard = NotifyGuard(&self.state);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn authorization_status(
        &self,
        _account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError> {
        let domain = Self::domain_of(url)?;
        let hangs = {
            let mut state = self.state.lock().unwrap();
            let script = state.scripts.entry(domain.clone()).or_default();
            script.hang_after.is_some_and(|answered| script.polled >= answered)
        };
        if hangs {
            self.state.lock().unwrap().calls.authorization_status += 1;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.authorization_status += 1;
        let script = state.scripts.entry(domain.clone()).or_default();
        if script.status_transport_error {
            return Err(CaError::Transport("connection reset by fake CA".into()));
        }
        let index = script.polled.min(script.statuses.len().saturating_sub(1));
        let status = script
            .statuses
            .get(index)
            .copied()
            .unwrap_or(AuthorizationStatus::Valid);
        script.polled += 1;
        let script = script.clone();
        Ok(Self::details(&domain, &script, status))
    }

    async fn submit_csr(
        &self,
        _account: &Account,
        _order: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<OrderState, CaError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.submit_csr += 1;
            state.csr = Some(csr_der.to_vec());
        }
        match self.order {
            OrderBehavior::RejectCsr => Err(CaError::Rejected {
                problem_type: "urn:ietf:params:acme:error:badCSR".into(),
                detail: "CSR rejected by fake CA".into(),
            }),
            OrderBehavior::Immediate | OrderBehavior::DownloadFails => Ok(OrderState {
                status: OrderStatus::Valid,
                certificate_url: Some(CERT_URL.into()),
                error: None,
            }),
            OrderBehavior::ProcessingFor(_)
            | OrderBehavior::BecomesInvalid
            | OrderBehavior::NeverCompletes => Ok(OrderState {
                status: OrderStatus::Processing,
                certificate_url: None,
                error: None,
            }),
        }
    }

    async fn order_status(
        &self,
        _account: &Account,
        _order: &OrderHandle,
    ) -> Result<OrderState, CaError> {
        let polls = {
            let mut state = self.state.lock().unwrap();
            state.calls.order_status += 1;
            state.calls.order_status
        };
        let processing = OrderState {
            status: OrderStatus::Processing,
            certificate_url: None,
            error: None,
        };
        let valid = OrderState {
            status: OrderStatus::Valid,
            certificate_url: Some(CERT_URL.into()),
            error: None,
        };
        Ok(match self.order {
            OrderBehavior::ProcessingFor(n) if polls < n => processing,
            OrderBehavior::NeverCompletes => processing,
            OrderBehavior::BecomesInvalid => OrderState {
                status: OrderStatus::Invalid,
                certificate_url: None,
                error: Some("fake CA refused to sign".into()),
            },
            _ => valid,
        })
    }

    async fn fetch_certificate(
        &self,
        _account: &Account,
        _certificate_url: &str,
    ) -> Result<String, CaError> {
        let csr = {
            let mut state = self.state.lock().unwrap();
            state.calls.fetch_certificate += 1;
            state.csr.clone()
        };
        if let OrderBehavior::DownloadFails = self.order {
            return Err(CaError::Transport("certificate download interrupted".into()));
        }
        let csr = csr.ok_or_else(|| CaError::Protocol("no CSR submitted".into()))?;
        self.sign_csr(&csr)
    }
}

#[derive(Default)]
struct PublisherState {
    published: Vec<(String, String, String)>,
    withdrawn: Vec<(String, String)>,
    live: usize,
    max_live: usize,
}

/// Publisher that only records calls. `failing()` rejects every publication.
#[derive(Default)]
pub struct RecordingPublisher {
    fail: bool,
    state: Mutex<PublisherState>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// (domain, token, key authorization) per publication.
    pub fn published(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn withdrawn(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().withdrawn.clone()
    }

    /// Highest number of proofs published at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_live
    }
}

#[async_trait]
impl ChallengePublisher for RecordingPublisher {
    async fn publish(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Io {
                path: format!("/srv/site/.well-known/acme-challenge/{token}").into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state
            .published
            .push((domain.into(), token.into(), key_authorization.into()));
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(())
    }

    async fn withdraw(&self, domain: &str, token: &str) -> Result<(), PublishError> {
        let mut state = self.state.lock().unwrap();
        state.withdrawn.push((domain.into(), token.into()));
        state.live = state.live.saturating_sub(1);
        Ok(())
    }
}
