// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use embercommon::identifiers::Uid;
use serde::{Deserialize, Serialize};

use crate::group::GroupUserMessageIdInfo;

/// Priority class of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationClass {
    Normal,
    /// Incoming-call pushes; routed over the VoIP channel where available
    /// and subject to QoS resend.
    Calling,
}

/// Push registration snapshot of the target device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushTargets {
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
    pub os_type: u32,
    #[serde(default)]
    pub build_code: u64,
}

impl From<&GroupUserMessageIdInfo> for PushTargets {
    fn from(info: &GroupUserMessageIdInfo) -> Self {
        Self {
            gcm_id: info.gcm_id.clone(),
            umeng_id: info.umeng_id.clone(),
            apn_id: info.apn_id.clone(),
            apn_type: info.apn_type.clone(),
            voip_apn_id: info.voip_apn_id.clone(),
            os_type: info.os_type,
            build_code: info.build_code,
        }
    }
}

/// One push to one user about one group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// Process-unique id; the QoS cancel token is keyed by it.
    pub id: String,
    pub uid: Uid,
    pub gid: u64,
    pub mid: u64,
    pub class: NotificationClass,
    pub targets: PushTargets,
}

impl Notification {
    pub fn new(uid: Uid, gid: u64, mid: u64, targets: PushTargets) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            uid,
            gid,
            mid,
            class: NotificationClass::Normal,
            targets,
        }
    }

    /// The opaque data blob providers deliver to the app.
    pub fn data_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "gid": self.gid,
            "mid": self.mid,
        })
    }
}
