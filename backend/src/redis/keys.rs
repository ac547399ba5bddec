// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Names of the persisted Redis keys.

use embercommon::identifiers::Uid;

/// Hash `field = uid -> json GroupUserMessageIdInfo`, one per group.
pub const GROUP_USER_INFO_PREFIX: &str = "group_user_msg_";

/// Sorted set of pending offline triples, score = enqueue epoch seconds.
pub const GROUP_MSG_LIST: &str = "group_msg_list";

/// Hash of targeted-member sets, field = triple.
pub const GROUP_MULTI_MSG_LIST: &str = "group_multi_msg_list";

/// Short-TTL sentinel written by the replica liveness probe.
pub const GROUP_REDIS_ACTIVE: &str = "group_msg_active";

/// TTL of the liveness sentinel.
pub const GROUP_REDIS_ACTIVE_TTL_SECS: u64 = 15;

/// Per-uid APNs badge counter prefix.
pub const APNS_BADGE_PREFIX: &str = "apns_badge_";

/// Offline orchestrator lease key.
pub const OFFLINE_LEASE: &str = "offline_lease";

pub fn group_user_info_key(gid: u64) -> String {
    format!("{GROUP_USER_INFO_PREFIX}{gid}")
}

pub fn badge_key(uid: &Uid) -> String {
    format!("{APNS_BADGE_PREFIX}{uid}")
}
