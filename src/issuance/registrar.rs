use std::sync::Arc;

use log::{info, warn};

use crate::issuance::account::{Account, AccountKey};
use crate::issuance::directory::{AcmeDirectory, CaError, NewAccount, PROBLEM_USER_ACTION_REQUIRED};
use crate::issuance::error::IssuanceError;

#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    /// False when the CA already knew the key.
    pub created: bool,
}

/// Makes sure the account key is registered and the CA's current terms are
/// accepted before any order is placed.
pub struct AccountRegistrar {
    directory: Arc<dyn AcmeDirectory>,
}

impl AccountRegistrar {
    pub fn new(directory: Arc<dyn AcmeDirectory>) -> Self {
        Self { directory }
    }

    pub async fn register(
        &self,
        key: &AccountKey,
        contact_email: &str,
    ) -> Result<Registration, IssuanceError> {
        let contact = vec![format!("mailto:{contact_email}")];
        info!("[registrar] registering key {} for {}", key.thumbprint(), contact_email);

        let new_account = match self.directory.register_account(key, &contact).await {
            Ok(account) => account,
            Err(CaError::AccountExists) => {
                info!("[registrar] key already registered, looking up account");
                let url = self
                    .directory
                    .lookup_account(key)
                    .await
                    .map_err(|e| IssuanceError::Registration { detail: e.detail() })?;
                NewAccount {
                    url,
                    created: false,
                }
            }
            Err(err) if requires_user_action(&err) => {
                warn!("[registrar] CA requires agreement before registration: {}", err);
                return Err(IssuanceError::TermsNotAgreed {
                    detail: err.detail(),
                });
            }
            Err(err) => {
                warn!("[registrar] registration rejected: {}", err);
                return Err(IssuanceError::Registration {
                    detail: err.detail(),
                });
            }
        };

        if new_account.created {
            info!("[registrar] created account {}", new_account.url);
        } else {
            info!("[registrar] reusing account {}", new_account.url);
        }
        let account = Account::new(key.clone(), new_account.url);

        if let Err(err) = self.directory.agree_to_terms(&account).await {
            warn!("[registrar] terms of service not accepted: {}", err);
            return Err(IssuanceError::TermsNotAgreed {
                detail: err.detail(),
            });
        }

        Ok(Registration {
            account,
            created: new_account.created,
        })
    }
}

fn requires_user_action(err: &CaError) -> bool {
    err.problem_type() == Some(PROBLEM_USER_ACTION_REQUIRED)
}
