// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory [`AccountStore`] used in tests and single-node setups. The
//! production deployment plugs the external account service in behind the
//! same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use embercommon::identifiers::Uid;
use tokio::sync::RwLock;

use super::{Account, AccountStore, AccountStoreError, ModifyAccount, apply_mutations};

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<Uid, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, uid: &Uid) -> Result<Option<Account>, AccountStoreError> {
        Ok(self.accounts.read().await.get(uid).cloned())
    }

    async fn create_account(&self, account: Account) -> Result<(), AccountStoreError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.uid) {
            return Err(AccountStoreError::AlreadyExists);
        }
        accounts.insert(account.uid.clone(), account);
        Ok(())
    }

    async fn delete_account(&self, uid: &Uid) -> Result<(), AccountStoreError> {
        self.accounts
            .write()
            .await
            .remove(uid)
            .map(|_| ())
            .ok_or(AccountStoreError::NotFound)
    }

    async fn apply(&self, modify: ModifyAccount) -> Result<Account, AccountStoreError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(modify.uid())
            .ok_or(AccountStoreError::NotFound)?;
        apply_mutations(account, modify.mutations())?;
        Ok(account.clone())
    }
}

#[cfg(test)]
mod tests {
    use embercommon::{MASTER_DEVICE_ID, auth::AuthCredential};

    use crate::account::{AccountState, Device};

    use super::*;

    #[tokio::test]
    async fn create_get_modify_delete() {
        let store = InMemoryAccountStore::new();
        let uid = Uid::new("u1");
        let account = Account {
            uid: uid.clone(),
            public_key: "pk".into(),
            state: AccountState::Normal,
            devices: vec![Device::new(MASTER_DEVICE_ID, AuthCredential::derive("t"))],
        };
        store.create_account(account.clone()).await.unwrap();
        assert!(matches!(
            store.create_account(account).await,
            Err(AccountStoreError::AlreadyExists)
        ));

        let modify = ModifyAccount::new(uid.clone()).set_gcm_registration(
            MASTER_DEVICE_ID,
            "gcm-token".into(),
            String::new(),
        );
        let updated = store.apply(modify).await.unwrap();
        assert_eq!(updated.devices[0].gcm_id, "gcm-token");

        store.delete_account(&uid).await.unwrap();
        assert!(store.get_account(&uid).await.unwrap().is_none());
    }
}
