// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Group message operations: send, recall, fetch, ack, and the Redis
//! bookkeeping that feeds the offline orchestrator.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use embercommon::{
    codec,
    crypto::{sender_envelope::SenderEnvelope, signature::verify_signature},
    identifiers::{DispatchAddress, Uid},
    messages::{PubSubKind, PubSubMessage},
    time::now_millis,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    account::{Account, Device},
    dispatch::DispatchManager,
    errors::{RedisError, StorageError},
    group::persistence::{GroupStorage, NewGroupMsg},
    offline::triple::OfflineMessageKey,
    redis::{PartitionKey, RedisRouter, keys},
    settings::GroupSettings,
};

use super::{
    GroupMsg, GroupMsgStatus, GroupMsgType, GroupMultiBroadcastInfo, GroupUserMessageIdInfo,
    PushPeopleType,
};

/// Max messages served by one fetch.
pub const MAX_FETCH_COUNT: usize = 50;

/// How long after sending a message may still be recalled.
pub const RECALL_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum GroupOpError {
    #[error("message too long")]
    MessageTooLong,
    #[error("group not found")]
    GroupNotFound,
    #[error("invalid broadcast value")]
    InvalidBroadcast,
    #[error("member not exist")]
    NotMember,
    #[error("subscriber cannot send group message")]
    SubscriberCannotSend,
    #[error("encrypt sender failed")]
    EncryptSenderFailed,
    #[error("cannot recall other's message")]
    RecallNotOwner,
    #[error("should recall a chat message")]
    RecallWrongType,
    #[error("message is recalled")]
    AlreadyRecalled,
    #[error("this message is weathered :-)")]
    RecallWindowExpired,
    #[error("query message error")]
    MessageQueryFailed,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Redis(#[from] RedisError),
}

impl GroupOpError {
    /// Wire error code of the failure, matched by clients.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::MessageTooLong => 400,
            Self::GroupNotFound | Self::NotMember | Self::Storage(_) => 1,
            Self::InvalidBroadcast => 100402,
            Self::SubscriberCannotSend => 100401,
            Self::EncryptSenderFailed | Self::Redis(_) => 500,
            Self::RecallNotOwner | Self::RecallWrongType | Self::AlreadyRecalled => 1101002,
            Self::RecallWindowExpired => 1101003,
            Self::MessageQueryFailed => 1101004,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SendMessageRequest {
    pub gid: u64,
    pub text: String,
    pub at_list: Vec<String>,
    pub at_all: bool,
    /// Group message public key the sealed sender envelope is built
    /// against; empty from clients that pre-date sealed sender.
    pub pub_key: String,
    pub sig: String,
}

#[derive(Clone, Debug)]
pub struct RecallMessageRequest {
    pub gid: u64,
    pub mid: u64,
    /// Base64 IV whose signature proves authorship when `from_uid` is
    /// hidden.
    pub iv: String,
    pub pub_key: String,
}

#[derive(Clone, Copy, Debug)]
pub struct SendOutcome {
    pub gid: u64,
    pub mid: u64,
    pub create_time_ms: u64,
}

pub struct GroupMsgService {
    storage: GroupStorage,
    router: Arc<RedisRouter>,
    dispatch: Arc<DispatchManager>,
    settings: GroupSettings,
}

impl GroupMsgService {
    pub fn new(
        storage: GroupStorage,
        router: Arc<RedisRouter>,
        dispatch: Arc<DispatchManager>,
        settings: GroupSettings,
    ) -> Self {
        Self {
            storage,
            router,
            dispatch,
            settings,
        }
    }

    /// Send a message into a group.
    pub async fn send_message(
        &self,
        sender: &Account,
        req: SendMessageRequest,
    ) -> Result<SendOutcome, GroupOpError> {
        if req.text.len() > self.settings.message_size_limit {
            return Err(GroupOpError::MessageTooLong);
        }

        let group = self
            .storage
            .get_group(req.gid)
            .await?
            .ok_or(GroupOpError::GroupNotFound)?;
        let msg_type = match group.broadcast {
            0 => GroupMsgType::Chat,
            b if b > 0 => GroupMsgType::Channel,
            _ => return Err(GroupOpError::InvalidBroadcast),
        };

        let role = self
            .storage
            .get_member_role(req.gid, sender.uid.as_str())
            .await?
            .ok_or(GroupOpError::NotMember)?;
        if !role.may_send() {
            return Err(GroupOpError::SubscriberCannotSend);
        }

        let source_extra = self.seal_sender(sender, &req.pub_key)?;
        let from_uid_stored = if self.settings.plain_uid_support {
            sender.uid.to_string()
        } else {
            String::new()
        };

        let create_time_ms = now_millis();
        let new_msg = NewGroupMsg {
            gid: req.gid,
            from_uid: from_uid_stored,
            msg_type,
            text: req.text,
            at_list: req.at_list,
            at_all: req.at_all,
            source_extra,
            verify_sig: req.sig,
            create_time_ms,
        };
        let mid = self.storage.insert_message(&new_msg).await?;
        info!(gid = req.gid, mid, uid = %sender.uid, "group message stored");

        // The fan-out copy carries the sender uid so receivers can skip
        // notifying the author.
        let fanout = GroupMsg {
            gid: req.gid,
            mid,
            from_uid: sender.uid.to_string(),
            msg_type,
            text: new_msg.text.clone(),
            status: GroupMsgStatus::Normal,
            at_list: new_msg.at_list.clone(),
            at_all: new_msg.at_all,
            source_extra: new_msg.source_extra.clone(),
            verify_sig: new_msg.verify_sig.clone(),
            create_time_ms,
        };
        self.fan_out(&fanout).await;
        self.update_offline_index(req.gid, mid, PushPeopleType::ToAll, sender.uid.as_str(), &[])
            .await;
        self.bump_sender_last_mid(req.gid, mid, &sender.uid).await;

        Ok(SendOutcome {
            gid: req.gid,
            mid,
            create_time_ms,
        })
    }

    /// Recall a previously sent message.
    pub async fn recall_message(
        &self,
        sender: &Account,
        req: RecallMessageRequest,
    ) -> Result<SendOutcome, GroupOpError> {
        let msg = self
            .storage
            .get_message(req.gid, req.mid)
            .await
            .map_err(|_| GroupOpError::MessageQueryFailed)?
            .ok_or(GroupOpError::MessageQueryFailed)?;

        // With a cleartext sender, uid equality decides; otherwise the
        // caller proves authorship by signing the original IV.
        let sender_verified = if !msg.from_uid.is_empty() {
            msg.from_uid == sender.uid.as_str()
        } else {
            match STANDARD.decode(&req.iv) {
                Ok(iv) => verify_signature(&sender.public_key, &iv, &msg.verify_sig),
                Err(_) => false,
            }
        };
        if !sender_verified {
            return Err(GroupOpError::RecallNotOwner);
        }

        if msg.msg_type != GroupMsgType::Chat && msg.msg_type != GroupMsgType::Channel {
            return Err(GroupOpError::RecallWrongType);
        }
        if msg.status == GroupMsgStatus::Recalled {
            return Err(GroupOpError::AlreadyRecalled);
        }
        if !recall_window_open(msg.create_time_ms, now_millis()) {
            return Err(GroupOpError::RecallWindowExpired);
        }

        let source_extra = self.seal_sender(sender, &req.pub_key)?;
        let from_uid_stored = if self.settings.plain_uid_support {
            sender.uid.to_string()
        } else {
            String::new()
        };

        let now = now_millis();
        let marker_text = serde_json::json!({ "recalled_mid": req.mid }).to_string();
        let marker = NewGroupMsg {
            gid: req.gid,
            from_uid: from_uid_stored,
            msg_type: GroupMsgType::Recall,
            text: marker_text.clone(),
            at_list: Vec::new(),
            at_all: false,
            source_extra,
            verify_sig: String::new(),
            create_time_ms: now,
        };
        let new_mid = self
            .storage
            .recall_message(req.gid, req.mid, &marker)
            .await
            .map_err(|_| GroupOpError::MessageQueryFailed)?;
        info!(gid = req.gid, recalled = req.mid, marker = new_mid, "message recalled");

        let fanout = GroupMsg {
            gid: req.gid,
            mid: new_mid,
            from_uid: sender.uid.to_string(),
            msg_type: GroupMsgType::Recall,
            text: marker_text,
            status: GroupMsgStatus::Normal,
            at_list: Vec::new(),
            at_all: false,
            source_extra: marker.source_extra.clone(),
            verify_sig: String::new(),
            create_time_ms: now,
        };
        self.fan_out(&fanout).await;
        self.update_offline_index(
            req.gid,
            new_mid,
            PushPeopleType::ToAll,
            sender.uid.as_str(),
            &[],
        )
        .await;
        self.bump_sender_last_mid(req.gid, new_mid, &sender.uid).await;

        Ok(SendOutcome {
            gid: req.gid,
            mid: new_mid,
            create_time_ms: now,
        })
    }

    /// Fetch a mid range for a member.
    pub async fn fetch_messages(
        &self,
        uid: &Uid,
        gid: u64,
        from_mid: u64,
        to_mid: u64,
        supports_recall: bool,
    ) -> Result<Vec<GroupMsg>, GroupOpError> {
        self.storage
            .get_member_role(gid, uid.as_str())
            .await?
            .ok_or(GroupOpError::NotMember)?;
        Ok(self
            .storage
            .fetch_messages(gid, from_mid, to_mid, MAX_FETCH_COUNT, supports_recall)
            .await?)
    }

    /// Record the member's ack. Besides the durable row this refreshes the
    /// member's Redis record so the offline scan stops considering already
    /// seen mids.
    pub async fn ack_message(
        &self,
        account: &Account,
        device: &Device,
        gid: u64,
        last_ack_mid: u64,
    ) -> Result<(), GroupOpError> {
        self.storage
            .get_member_role(gid, account.uid.as_str())
            .await?
            .ok_or(GroupOpError::NotMember)?;
        self.storage
            .update_last_ack(gid, account.uid.as_str(), last_ack_mid)
            .await?;

        if let Err(e) = self
            .upsert_user_info(gid, &account.uid, |info| {
                info.last_mid = info.last_mid.max(last_ack_mid);
                apply_device_snapshot(info, device);
            })
            .await
        {
            warn!(gid, uid = %account.uid, error = %e, "ack redis upsert failed");
        }
        Ok(())
    }

    /// Rewrite the push registration snapshot of every group record of the
    /// account. Called on token registration and unregistration; writing
    /// blanks is what prevents ghost pushes after logout.
    pub async fn refresh_push_snapshot(&self, account: &Account, device: &Device) {
        let groups = match self.storage.list_groups_of(account.uid.as_str()).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(uid = %account.uid, error = %e, "cannot list groups for snapshot refresh");
                return;
            }
        };
        for gid in groups {
            if let Err(e) = self
                .upsert_user_info(gid, &account.uid, |info| apply_device_snapshot(info, device))
                .await
            {
                warn!(gid, uid = %account.uid, error = %e, "push snapshot refresh failed");
            }
        }
    }

    fn seal_sender(&self, sender: &Account, pub_key: &str) -> Result<String, GroupOpError> {
        if !pub_key.is_empty() {
            let envelope = SenderEnvelope::seal(sender.uid.as_str(), pub_key)
                .map_err(|_| GroupOpError::EncryptSenderFailed)?;
            serde_json::to_string(&envelope).map_err(|_| GroupOpError::EncryptSenderFailed)
        } else if self.settings.plain_uid_support {
            Ok(String::new())
        } else {
            // client too old for sealed sender on a cluster that requires it
            Err(GroupOpError::EncryptSenderFailed)
        }
    }

    /// Deliver the message to every member except the author: local
    /// sessions directly, absent members via their master-device channel.
    async fn fan_out(&self, msg: &GroupMsg) {
        let members = match self.storage.list_member_uids(msg.gid).await {
            Ok(members) => members,
            Err(e) => {
                warn!(gid = msg.gid, error = %e, "cannot list members for fan-out");
                return;
            }
        };
        let content = match codec::to_vec(msg) {
            Ok(content) => content,
            Err(e) => {
                warn!(gid = msg.gid, mid = msg.mid, error = %e, "cannot encode fan-out message");
                return;
            }
        };
        for member in members {
            if member == msg.from_uid {
                continue;
            }
            let uid = Uid::new(member);
            let mut addresses = self.dispatch.local_addresses_for(&uid);
            if addresses.is_empty() {
                addresses.push(DispatchAddress::master(uid));
            }
            for address in addresses {
                // A false return is fine: the offline scan picks the member
                // up after the visibility window.
                self.dispatch
                    .publish(PubSubMessage {
                        address,
                        kind: PubSubKind::GroupMessage,
                        content: content.clone(),
                    })
                    .await;
            }
        }
    }

    async fn update_offline_index(
        &self,
        gid: u64,
        mid: u64,
        push_type: PushPeopleType,
        from_uid: &str,
        members: &[String],
    ) {
        let key = OfflineMessageKey {
            gid,
            mid,
            push_type,
        };
        let triple = key.encode();

        let info = GroupMultiBroadcastInfo {
            members: members.iter().cloned().collect(),
            from_uid: from_uid.to_owned(),
        };
        if let Err(e) = self
            .router
            .hset(
                PartitionKey::Gid(gid),
                keys::GROUP_MULTI_MSG_LIST,
                &triple,
                &info.to_json(),
            )
            .await
        {
            warn!(gid, mid, error = %e, "offline companion hset failed");
        }

        if let Err(e) = self
            .router
            .zadd(
                PartitionKey::Gid(gid),
                keys::GROUP_MSG_LIST,
                &triple,
                embercommon::time::now_secs() as i64,
            )
            .await
        {
            warn!(gid, mid, error = %e, "offline zadd failed");
        }
    }

    async fn bump_sender_last_mid(&self, gid: u64, mid: u64, uid: &Uid) {
        if let Err(e) = self
            .upsert_user_info(gid, uid, |info| info.last_mid = info.last_mid.max(mid))
            .await
        {
            warn!(gid, uid = %uid, error = %e, "sender last_mid upsert failed");
        }
    }

    /// Read-modify-write of one `group_user_msg_<gid>` hash field.
    async fn upsert_user_info(
        &self,
        gid: u64,
        uid: &Uid,
        mutate: impl FnOnce(&mut GroupUserMessageIdInfo),
    ) -> Result<(), RedisError> {
        let hash_key = keys::group_user_info_key(gid);
        let existing = self
            .router
            .hget(PartitionKey::Gid(gid), &hash_key, uid.as_str())
            .await?;
        let mut info = existing
            .as_deref()
            .and_then(GroupUserMessageIdInfo::from_json)
            .unwrap_or_default();
        mutate(&mut info);
        self.router
            .hset(PartitionKey::Gid(gid), &hash_key, uid.as_str(), &info.to_json())
            .await
    }
}

/// Copy the device's push registration into the Redis snapshot.
fn apply_device_snapshot(info: &mut GroupUserMessageIdInfo, device: &Device) {
    info.gcm_id = device.gcm_id.clone();
    info.umeng_id = device.umeng_id.clone();
    info.apn_id = device.apn_id.clone();
    info.apn_type = device.apn_type.clone();
    info.voip_apn_id = device.voip_apn_id.clone();
    info.os_type = device.client_version.os_type;
    info.os_version = device.client_version.os_version.clone();
    info.build_code = device.client_version.build_code;
    info.phone_model = device.client_version.phone_model.clone();
}

/// Whether a message sent at `created_ms` may still be recalled at `now_ms`.
pub fn recall_window_open(created_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(created_ms) <= RECALL_WINDOW_MS
}

#[cfg(test)]
mod tests {
    use crate::account::ClientVersion;

    use super::*;

    #[test]
    fn recall_window_boundaries() {
        let sent = 1_700_000_000_000u64;
        // t = 23h59m
        assert!(recall_window_open(sent, sent + RECALL_WINDOW_MS - 60_000));
        // exactly at the window edge
        assert!(recall_window_open(sent, sent + RECALL_WINDOW_MS));
        // t = 24h01m
        assert!(!recall_window_open(sent, sent + RECALL_WINDOW_MS + 60_000));
    }

    #[test]
    fn device_snapshot_copies_all_push_fields() {
        let mut device = Device::new(1, embercommon::auth::AuthCredential::derive("t"));
        device.apn_id = "apn".into();
        device.apn_type = "prod".into();
        device.voip_apn_id = "voip".into();
        device.client_version = ClientVersion {
            os_type: 1,
            os_version: "17.0".into(),
            build_code: 4242,
            phone_model: "iPhone15,2".into(),
        };

        let mut info = GroupUserMessageIdInfo {
            last_mid: 9,
            ..Default::default()
        };
        apply_device_snapshot(&mut info, &device);
        assert_eq!(info.last_mid, 9, "snapshot must not touch last_mid");
        assert_eq!(info.apn_id, "apn");
        assert_eq!(info.voip_apn_id, "voip");
        assert_eq!(info.build_code, 4242);
    }
}
