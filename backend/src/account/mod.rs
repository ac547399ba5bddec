// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Account and device records as consumed by the delivery core.
//!
//! The durable account store itself is an external collaborator; this module
//! defines the record types, the [`ModifyAccount`] change set that every
//! mutation must flow through, and the [`AccountStore`] interface the rest
//! of the backend programs against.

mod memory;

pub use memory::InMemoryAccountStore;

use async_trait::async_trait;
use embercommon::{MASTER_DEVICE_ID, auth::AuthCredential, identifiers::Uid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    Normal,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Normal,
    Confirmed,
    Logout,
}

/// Client build information reported at login.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub os_type: u32,
    pub os_version: String,
    pub build_code: u64,
    pub phone_model: String,
}

/// One device of an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: u32,
    pub auth: AuthCredential,
    #[serde(default)]
    pub gcm_id: String,
    #[serde(default)]
    pub umeng_id: String,
    #[serde(default)]
    pub apn_id: String,
    #[serde(default)]
    pub apn_type: String,
    #[serde(default)]
    pub voip_apn_id: String,
    #[serde(default)]
    pub client_version: ClientVersion,
    #[serde(default)]
    pub last_seen_ms: u64,
    pub state: DeviceState,
}

impl Device {
    pub fn new(id: u32, auth: AuthCredential) -> Self {
        Self {
            id,
            auth,
            gcm_id: String::new(),
            umeng_id: String::new(),
            apn_id: String::new(),
            apn_type: String::new(),
            voip_apn_id: String::new(),
            client_version: ClientVersion::default(),
            last_seen_ms: 0,
            state: DeviceState::Normal,
        }
    }

    /// A device with no push registration at all cannot be reached offline.
    pub fn is_push_capable(&self) -> bool {
        !(self.gcm_id.is_empty()
            && self.umeng_id.is_empty()
            && self.apn_id.is_empty()
            && self.voip_apn_id.is_empty())
    }
}

/// An account with its devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub uid: Uid,
    /// Base64 public key; the uid is derived from it.
    pub public_key: String,
    pub state: AccountState,
    pub devices: Vec<Device>,
}

impl Account {
    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    pub fn master_device(&self) -> Option<&Device> {
        self.device(MASTER_DEVICE_ID)
    }
}

/// One intended device- or account-level change.
#[derive(Clone, Debug)]
pub enum AccountMutation {
    SetAccountState(AccountState),
    PutDevice(Device),
    RemoveDevice(u32),
    SetDeviceState {
        device_id: u32,
        state: DeviceState,
    },
    SetDeviceAuth {
        device_id: u32,
        auth: AuthCredential,
    },
    SetApnRegistration {
        device_id: u32,
        apn_id: String,
        apn_type: String,
        voip_apn_id: String,
    },
    SetGcmRegistration {
        device_id: u32,
        gcm_id: String,
        umeng_id: String,
    },
    /// Blank every push registration of the device. Used on logout and
    /// unregister so no ghost pushes can be produced from stale snapshots.
    ClearPushRegistrations {
        device_id: u32,
    },
    SetClientVersion {
        device_id: u32,
        version: ClientVersion,
    },
    Touch {
        device_id: u32,
        last_seen_ms: u64,
    },
}

/// Change set for one account.
///
/// The store applies the recorded mutations as a single compare-and-set
/// against the version of the account the caller read.
#[derive(Clone, Debug)]
pub struct ModifyAccount {
    uid: Uid,
    mutations: Vec<AccountMutation>,
}

impl ModifyAccount {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            mutations: Vec::new(),
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn mutations(&self) -> &[AccountMutation] {
        &self.mutations
    }

    pub fn push(mut self, mutation: AccountMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn set_account_state(self, state: AccountState) -> Self {
        self.push(AccountMutation::SetAccountState(state))
    }

    pub fn put_device(self, device: Device) -> Self {
        self.push(AccountMutation::PutDevice(device))
    }

    pub fn set_apn_registration(
        self,
        device_id: u32,
        apn_id: String,
        apn_type: String,
        voip_apn_id: String,
    ) -> Self {
        self.push(AccountMutation::SetApnRegistration {
            device_id,
            apn_id,
            apn_type,
            voip_apn_id,
        })
    }

    pub fn set_gcm_registration(self, device_id: u32, gcm_id: String, umeng_id: String) -> Self {
        self.push(AccountMutation::SetGcmRegistration {
            device_id,
            gcm_id,
            umeng_id,
        })
    }

    pub fn clear_push_registrations(self, device_id: u32) -> Self {
        self.push(AccountMutation::ClearPushRegistrations { device_id })
    }

    pub fn touch(self, device_id: u32, last_seen_ms: u64) -> Self {
        self.push(AccountMutation::Touch {
            device_id,
            last_seen_ms,
        })
    }
}

#[derive(Debug, Error)]
pub enum AccountStoreError {
    #[error("account not found")]
    NotFound,
    #[error("account already exists")]
    AlreadyExists,
    #[error("concurrent modification, retry")]
    VersionMismatch,
    #[error("store error: {0}")]
    Storage(String),
}

/// Interface of the external account store.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, uid: &Uid) -> Result<Option<Account>, AccountStoreError>;

    async fn create_account(&self, account: Account) -> Result<(), AccountStoreError>;

    async fn delete_account(&self, uid: &Uid) -> Result<(), AccountStoreError>;

    /// Apply a change set as a compare-and-set against the current account
    /// version.
    async fn apply(&self, modify: ModifyAccount) -> Result<Account, AccountStoreError>;
}

pub(crate) fn apply_mutations(
    account: &mut Account,
    mutations: &[AccountMutation],
) -> Result<(), AccountStoreError> {
    for mutation in mutations {
        match mutation {
            AccountMutation::SetAccountState(state) => account.state = *state,
            AccountMutation::PutDevice(device) => {
                account.devices.retain(|d| d.id != device.id);
                account.devices.push(device.clone());
            }
            AccountMutation::RemoveDevice(device_id) => {
                account.devices.retain(|d| d.id != *device_id);
            }
            AccountMutation::SetDeviceState { device_id, state } => {
                device_mut(account, *device_id)?.state = *state;
            }
            AccountMutation::SetDeviceAuth { device_id, auth } => {
                device_mut(account, *device_id)?.auth = auth.clone();
            }
            AccountMutation::SetApnRegistration {
                device_id,
                apn_id,
                apn_type,
                voip_apn_id,
            } => {
                let device = device_mut(account, *device_id)?;
                device.apn_id = apn_id.clone();
                device.apn_type = apn_type.clone();
                device.voip_apn_id = voip_apn_id.clone();
            }
            AccountMutation::SetGcmRegistration {
                device_id,
                gcm_id,
                umeng_id,
            } => {
                let device = device_mut(account, *device_id)?;
                device.gcm_id = gcm_id.clone();
                device.umeng_id = umeng_id.clone();
            }
            AccountMutation::ClearPushRegistrations { device_id } => {
                let device = device_mut(account, *device_id)?;
                device.gcm_id.clear();
                device.umeng_id.clear();
                device.apn_id.clear();
                device.apn_type.clear();
                device.voip_apn_id.clear();
            }
            AccountMutation::SetClientVersion { device_id, version } => {
                device_mut(account, *device_id)?.client_version = version.clone();
            }
            AccountMutation::Touch {
                device_id,
                last_seen_ms,
            } => {
                device_mut(account, *device_id)?.last_seen_ms = *last_seen_ms;
            }
        }
    }
    Ok(())
}

fn device_mut(account: &mut Account, device_id: u32) -> Result<&mut Device, AccountStoreError> {
    account
        .devices
        .iter_mut()
        .find(|d| d.id == device_id)
        .ok_or(AccountStoreError::NotFound)
}

#[cfg(test)]
mod tests {
    use embercommon::auth::AuthCredential;

    use super::*;

    fn account_with_master() -> Account {
        Account {
            uid: Uid::new("u1"),
            public_key: "pk".into(),
            state: AccountState::Normal,
            devices: vec![Device::new(MASTER_DEVICE_ID, AuthCredential::derive("t"))],
        }
    }

    #[test]
    fn clear_push_registrations_blanks_everything() {
        let mut account = account_with_master();
        account.devices[0].apn_id = "apn".into();
        account.devices[0].gcm_id = "gcm".into();
        assert!(account.devices[0].is_push_capable());

        let modify = ModifyAccount::new(account.uid.clone()).clear_push_registrations(1);
        apply_mutations(&mut account, modify.mutations()).unwrap();
        assert!(!account.devices[0].is_push_capable());
    }

    #[test]
    fn mutation_against_unknown_device_fails() {
        let mut account = account_with_master();
        let modify = ModifyAccount::new(account.uid.clone()).touch(9, 123);
        assert!(apply_mutations(&mut account, modify.mutations()).is_err());
    }
}
