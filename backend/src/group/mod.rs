// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-group and per-user message state.

pub mod persistence;
pub mod service;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Type of a group message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMsgType {
    Chat,
    Channel,
    Recall,
    MemberUpdate,
}

impl GroupMsgType {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Chat => 1,
            Self::Channel => 2,
            Self::Recall => 3,
            Self::MemberUpdate => 4,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Chat),
            2 => Some(Self::Channel),
            3 => Some(Self::Recall),
            4 => Some(Self::MemberUpdate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMsgStatus {
    Normal,
    Recalled,
}

impl GroupMsgStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Normal => 0,
            Self::Recalled => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Recalled),
            _ => None,
        }
    }
}

/// Role of a group member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Admin,
    Member,
    Subscriber,
}

impl Role {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Owner => 1,
            Self::Admin => 2,
            Self::Member => 3,
            Self::Subscriber => 4,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Owner),
            2 => Some(Self::Admin),
            3 => Some(Self::Member),
            4 => Some(Self::Subscriber),
            _ => None,
        }
    }

    /// Subscribers follow a channel but may not post to it.
    pub fn may_send(self) -> bool {
        self != Self::Subscriber
    }
}

/// A group row as the delivery core sees it.
#[derive(Clone, Debug)]
pub struct Group {
    pub gid: u64,
    pub last_mid: u64,
    /// 0 = chat group, > 0 = broadcast channel.
    pub broadcast: i32,
    pub encrypted: bool,
}

/// Group membership of one uid.
#[derive(Clone, Debug)]
pub struct GroupUser {
    pub gid: u64,
    pub uid: String,
    pub role: Role,
    pub last_ack_mid: u64,
}

/// One stored group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupMsg {
    pub gid: u64,
    pub mid: u64,
    /// Blank when the cluster hides sender identities; the sealed envelope
    /// in `source_extra` carries the sender then.
    pub from_uid: String,
    #[serde(rename = "type")]
    pub msg_type: GroupMsgType,
    /// Opaque ciphertext.
    pub text: String,
    pub status: GroupMsgStatus,
    pub at_list: Vec<String>,
    pub at_all: bool,
    pub source_extra: String,
    pub verify_sig: String,
    pub create_time_ms: u64,
}

/// Who a pending offline triple addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushPeopleType {
    ToAll,
    ToDesignatedPerson,
}

impl PushPeopleType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::ToAll => 1,
            Self::ToDesignatedPerson => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ToAll),
            2 => Some(Self::ToDesignatedPerson),
            _ => None,
        }
    }
}

/// Whether a user opted out of offline pushes for the group.
pub const CFG_FLAG_NORMAL: i32 = 0;
pub const CFG_FLAG_NO_CONFIG: i32 = 1;

/// The per-(gid, uid) record in the `group_user_msg_<gid>` hash.
///
/// Every field is optional on decode; records written by older builds may
/// miss any of them. Absence of the whole record means the user is fully
/// caught up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUserMessageIdInfo {
    #[serde(default)]
    pub last_mid: u64,
    #[serde(default, rename = "gcmId")]
    pub gcm_id: String,
    #[serde(default, rename = "umengId")]
    pub umeng_id: String,
    #[serde(default, rename = "apnId")]
    pub apn_id: String,
    #[serde(default, rename = "apnType")]
    pub apn_type: String,
    #[serde(default, rename = "voipApnId")]
    pub voip_apn_id: String,
    #[serde(default, rename = "osType")]
    pub os_type: u32,
    #[serde(default, rename = "osVersion")]
    pub os_version: String,
    #[serde(default, rename = "buildCode")]
    pub build_code: u64,
    #[serde(default, rename = "phoneModel")]
    pub phone_model: String,
    #[serde(default, rename = "targetAddress")]
    pub target_address: String,
    #[serde(default, rename = "cfgFlag")]
    pub cfg_flag: i32,
}

impl GroupUserMessageIdInfo {
    pub fn is_push_capable(&self) -> bool {
        !(self.gcm_id.is_empty()
            && self.umeng_id.is_empty()
            && self.apn_id.is_empty()
            && self.voip_apn_id.is_empty())
    }

    pub fn wants_push(&self) -> bool {
        self.cfg_flag == CFG_FLAG_NORMAL
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("info serializes")
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

/// Companion record for targeted messages: the member set the triple
/// addresses, and the sender to exclude.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupMultiBroadcastInfo {
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub from_uid: String,
}

impl GroupMultiBroadcastInfo {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("info serializes")
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_info_decodes_with_missing_fields() {
        let info = GroupUserMessageIdInfo::from_json(r#"{"last_mid": 17}"#).unwrap();
        assert_eq!(info.last_mid, 17);
        assert!(!info.is_push_capable());
        assert!(info.wants_push());
    }

    #[test]
    fn user_info_roundtrips_wire_names(){
        let info = GroupUserMessageIdInfo {
            last_mid: 5,
            apn_id: "apn-token".into(),
            apn_type: "prod".into(),
            cfg_flag: CFG_FLAG_NO_CONFIG,
            ..Default::default()
        };
        let json = info.to_json();
        assert!(json.contains("\"apnId\""));
        assert!(json.contains("\"cfgFlag\""));
        let decoded = GroupUserMessageIdInfo::from_json(&json).unwrap();
        assert_eq!(decoded, info);
        assert!(!decoded.wants_push());
    }

    #[test]
    fn garbage_user_info_is_rejected() {
        assert!(GroupUserMessageIdInfo::from_json("not json").is_none());
    }

    #[test]
    fn multi_broadcast_info_tolerates_absent_from_uid() {
        let info = GroupMultiBroadcastInfo::from_json(r#"{"members": ["u1","u2"]}"#).unwrap();
        assert_eq!(info.members.len(), 2);
        assert!(info.from_uid.is_empty());
    }
}
