//! [`AcmeDirectory`] over the `acme2` client.
//!
//! acme2 signs every request, keeps the replay nonce and turns problem
//! documents into errors. The workflow refers to CA objects by URL, so the
//! accounts, orders and authorizations acme2 hands back are kept here between
//! calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acme2::{
    Account as CaAccount, AccountBuilder, Authorization, AuthorizationStatus as CaAuthorizationStatus,
    ChallengeStatus, Csr, Directory, DirectoryBuilder, Order, OrderBuilder,
    OrderStatus as CaOrderStatus,
};
use async_trait::async_trait;
use log::{debug, info};
use openssl::x509::X509Req;
use tokio::sync::OnceCell;

use crate::core::types::{AuthorizationStatus, ChallengeKind};
use crate::domain::DomainSet;
use crate::issuance::account::{Account, AccountKey};
use crate::issuance::directory::{
    AcmeDirectory, AuthorizationDetails, CaError, ChallengeDetails, NewAccount, OrderHandle,
    OrderState, OrderStatus, PROBLEM_ACCOUNT_DOES_NOT_EXIST, PROBLEM_ACCOUNT_EXISTS,
};

pub struct HttpAcmeDirectory {
    endpoint: String,
    request_timeout: Duration,
    directory: OnceCell<Arc<Directory>>,
    accounts: Mutex<HashMap<String, Arc<CaAccount>>>,
    /// Keyed by finalize URL; acme2 does not expose the order URL.
    orders: Mutex<HashMap<String, Arc<Order>>>,
    authorizations: Mutex<HashMap<String, Arc<Authorization>>>,
}

impl HttpAcmeDirectory {
    /// Nothing is fetched until the first call. Every request to the CA is
    /// cut off after `request_timeout`.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout,
            directory: OnceCell::new(),
            accounts: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            authorizations: Mutex::new(HashMap::new()),
        }
    }

    async fn call<T, F>(&self, what: &str, request: F) -> Result<T, CaError>
    where
        F: Future<Output = Result<T, acme2::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(ca_error),
            Err(_) => Err(CaError::Transport(format!(
                "{what} timed out after {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    async fn directory(&self) -> Result<Arc<Directory>, CaError> {
        self.directory
            .get_or_try_init(|| async {
                info!("[acme-http] fetching directory {}", self.endpoint);
                let mut builder = DirectoryBuilder::new(self.endpoint.clone());
                self.call("directory request", builder.build()).await
            })
            .await
            .cloned()
    }

    /// newAccount for `key`. With `contact = None` the CA only looks the key
    /// up and answers `accountDoesNotExist` for an unknown one.
    async fn post_account(
        &self,
        key: &AccountKey,
        contact: Option<&[String]>,
    ) -> Result<Arc<CaAccount>, CaError> {
        let directory = self.directory().await?;
        let mut builder = AccountBuilder::new(directory);
        builder.private_key(key.private_key());
        builder.terms_of_service_agreed(true);
        match contact {
            Some(contact) => {
                builder.contact(contact.to_vec());
            }
            None => {
                builder.only_return_existing(true);
            }
        }
        let account = self.call("newAccount request", builder.build()).await?;
        store(&self.accounts, account.id.clone(), account.clone());
        Ok(account)
    }

    async fn ca_account(&self, account: &Account) -> Result<Arc<CaAccount>, CaError> {
        match cached(&self.accounts, account.url()) {
            Some(found) => Ok(found),
            None => self.post_account(account.key(), None).await,
        }
    }

    fn order(&self, handle: &OrderHandle) -> Result<Arc<Order>, CaError> {
        cached(&self.orders, &handle.finalize_url)
            .ok_or_else(|| CaError::Protocol(format!("order {} was not created here", handle.url)))
    }

    async fn refresh_authorization(&self, url: &str) -> Result<AuthorizationDetails, CaError> {
        let authorization = cached(&self.authorizations, url)
            .ok_or_else(|| CaError::Protocol(format!("unknown authorization {url}")))?;
        let fresh = Arc::new(self.call("authorization request", authorization.poll()).await?);
        store(&self.authorizations, url.to_string(), fresh.clone());
        authorization_details(&fresh)
    }
}

#[async_trait]
impl AcmeDirectory for HttpAcmeDirectory {
    async fn register_account(
        &self,
        key: &AccountKey,
        contact: &[String],
    ) -> Result<NewAccount, CaError> {
        match self.post_account(key, None).await {
            Ok(existing) => {
                return Ok(NewAccount {
                    url: existing.id.clone(),
                    created: false,
                });
            }
            Err(err) if err.problem_type() == Some(PROBLEM_ACCOUNT_DOES_NOT_EXIST) => {}
            Err(err) => return Err(err),
        }

        info!("[acme-http] registering account for {}", contact.join(", "));
        let account = self.post_account(key, Some(contact)).await?;
        Ok(NewAccount {
            url: account.id.clone(),
            created: true,
        })
    }

    async fn lookup_account(&self, key: &AccountKey) -> Result<String, CaError> {
        Ok(self.post_account(key, None).await?.id.clone())
    }

    /// acme2 has no account update call. The agreement travels on newAccount,
    /// which the CA answers idempotently for a registered key.
    async fn agree_to_terms(&self, account: &Account) -> Result<(), CaError> {
        let directory = self.directory().await?;
        let Some(terms) = directory
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.clone())
        else {
            debug!("[acme-http] CA publishes no terms of service");
            return Ok(());
        };

        info!("[acme-http] agreeing to {} for {}", terms, account.url());
        self.post_account(account.key(), None).await?;
        Ok(())
    }

    async fn new_order(
        &self,
        account: &Account,
        domains: &DomainSet,
    ) -> Result<OrderHandle, CaError> {
        let mut builder = OrderBuilder::new(self.ca_account(account).await?);
        for domain in domains {
            builder.add_dns_identifier(domain.clone());
        }
        info!("[acme-http] creating order for {}", domains);
        let order = self.call("newOrder request", builder.build()).await?;
        let fetched = self
            .call("authorization request", order.authorizations())
            .await?;

        let mut authorizations = HashMap::new();
        for (url, authorization) in order.authorization_urls.iter().zip(fetched) {
            authorizations.insert(authorization.identifier.value.to_lowercase(), url.clone());
            store(&self.authorizations, url.clone(), Arc::new(authorization));
        }
        for domain in domains {
            if !authorizations.contains_key(domain) {
                return Err(CaError::Protocol(format!(
                    "order has no authorization for {domain}"
                )));
            }
        }

        let finalize_url = order.finalize_url.clone();
        store(&self.orders, finalize_url.clone(), Arc::new(order));
        Ok(OrderHandle {
            url: finalize_url.clone(),
            finalize_url,
            authorizations,
        })
    }

    async fn authorization(
        &self,
        _account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError> {
        self.refresh_authorization(url).await
    }

    async fn notify_challenge_ready(
        &self,
        _account: &Account,
        challenge: &ChallengeDetails,
    ) -> Result<(), CaError> {
        let authorization = {
            let Ok(authorizations) = self.authorizations.lock() else {
                return Err(CaError::Protocol("authorization cache poisoned".into()));
            };
            authorizations
                .values()
                .find(|authorization| {
                    authorization
                        .challenges
                        .iter()
                        .any(|offered| offered.url == challenge.url)
                })
                .cloned()
        };
        let target = authorization
            .and_then(|authorization| authorization.get_challenge(challenge.kind.as_str()))
            .ok_or_else(|| CaError::Protocol(format!("unknown challenge {}", challenge.url)))?;

        debug!("[acme-http] challenge ready at {}", challenge.url);
        self.call("challenge request", target.validate()).await?;
        Ok(())
    }

    async fn authorization_status(
        &self,
        _account: &Account,
        url: &str,
    ) -> Result<AuthorizationDetails, CaError> {
        self.refresh_authorization(url).await
    }

    async fn submit_csr(
        &self,
        _account: &Account,
        handle: &OrderHandle,
        csr_der: &[u8],
    ) -> Result<OrderState, CaError> {
        let order = self.order(handle)?;
        let request = X509Req::from_der(csr_der)
            .map_err(|e| CaError::Protocol(format!("invalid CSR: {e}")))?;
        info!("[acme-http] finalizing order {}", handle.url);
        let finalized = self
            .call("finalize request", order.finalize(Csr::Custom(request)))
            .await?;
        let state = order_state(&finalized);
        store(&self.orders, handle.finalize_url.clone(), Arc::new(finalized));
        Ok(state)
    }

    async fn order_status(
        &self,
        _account: &Account,
        handle: &OrderHandle,
    ) -> Result<OrderState, CaError> {
        let order = self.order(handle)?;
        let fresh = self.call("order request", order.poll()).await?;
        let state = order_state(&fresh);
        store(&self.orders, handle.finalize_url.clone(), Arc::new(fresh));
        Ok(state)
    }

    async fn fetch_certificate(
        &self,
        _account: &Account,
        certificate_url: &str,
    ) -> Result<String, CaError> {
        let order = {
            let Ok(orders) = self.orders.lock() else {
                return Err(CaError::Protocol("order cache poisoned".into()));
            };
            orders
                .values()
                .find(|order| order.certificate_url.as_deref() == Some(certificate_url))
                .cloned()
        }
        .ok_or_else(|| CaError::Protocol(format!("no order issued {certificate_url}")))?;

        info!("[acme-http] downloading certificate {}", certificate_url);
        let chain = self
            .call("certificate request", order.certificate())
            .await?
            .ok_or_else(|| CaError::Protocol("order carries no certificate".into()))?;

        let mut pem = String::new();
        for certificate in chain {
            let encoded = certificate
                .to_pem()
                .map_err(|e| CaError::Protocol(format!("unreadable certificate: {e}")))?;
            pem.push_str(&String::from_utf8_lossy(&encoded));
        }
        Ok(pem)
    }
}

fn cached<T>(map: &Mutex<HashMap<String, Arc<T>>>, key: &str) -> Option<Arc<T>> {
    map.lock().ok().and_then(|map| map.get(key).cloned())
}

fn store<T>(map: &Mutex<HashMap<String, Arc<T>>>, key: String, value: Arc<T>) {
    if let Ok(mut map) = map.lock() {
        map.insert(key, value);
    }
}

fn ca_error(err: acme2::Error) -> CaError {
    match err {
        acme2::Error::Server(problem) => {
            let problem_type = problem
                .r#type
                .clone()
                .unwrap_or_else(|| "about:blank".to_string());
            if problem_type == PROBLEM_ACCOUNT_EXISTS {
                return CaError::AccountExists;
            }
            let detail = problem.detail.clone().unwrap_or_else(|| problem_type.clone());
            CaError::Rejected {
                problem_type,
                detail,
            }
        }
        other => CaError::Transport(other.to_string()),
    }
}

fn authorization_details(authorization: &Authorization) -> Result<AuthorizationDetails, CaError> {
    let http_processing = authorization.challenges.iter().any(|challenge| {
        challenge.r#type == ChallengeKind::Http01.as_str()
            && challenge.status == ChallengeStatus::Processing
    });
    let status = match authorization.status {
        CaAuthorizationStatus::Pending if http_processing => AuthorizationStatus::Processing,
        CaAuthorizationStatus::Pending => AuthorizationStatus::Pending,
        CaAuthorizationStatus::Valid => AuthorizationStatus::Valid,
        CaAuthorizationStatus::Expired => AuthorizationStatus::Expired,
        // invalid, deactivated and revoked all end the authorization
        _ => AuthorizationStatus::Invalid,
    };

    let error = authorization
        .challenges
        .iter()
        .filter_map(|challenge| challenge.error.as_ref())
        .find_map(|problem| problem.detail.clone().or_else(|| problem.r#type.clone()));

    let challenges = authorization
        .challenges
        .iter()
        .filter_map(|challenge| {
            Some(ChallengeDetails {
                kind: ChallengeKind::from_acme(&challenge.r#type)?,
                url: challenge.url.clone(),
                token: challenge.token.clone()?,
            })
        })
        .collect();

    if authorization.identifier.value.is_empty() {
        return Err(CaError::Protocol("authorization names no identifier".into()));
    }
    Ok(AuthorizationDetails {
        domain: authorization.identifier.value.to_lowercase(),
        status,
        challenges,
        error,
    })
}

fn order_state(order: &Order) -> OrderState {
    let status = match order.status {
        CaOrderStatus::Pending => OrderStatus::Pending,
        CaOrderStatus::Ready => OrderStatus::Ready,
        CaOrderStatus::Processing => OrderStatus::Processing,
        CaOrderStatus::Valid => OrderStatus::Valid,
        _ => OrderStatus::Invalid,
    };
    OrderState {
        status,
        certificate_url: order.certificate_url.clone(),
        error: order
            .error
            .as_ref()
            .and_then(|problem| problem.detail.clone().or_else(|| problem.r#type.clone())),
    }
}
