// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The offline scan loop.
//!
//! Each round (leader only) walks the per-partition offline sorted sets,
//! drops aged-out triples, merges the per-group user records from every
//! partition, dedupes candidates so a user gets at most one notification
//! per round, and hands the result to the dispatcher. A triple is removed
//! only after its notifications were submitted.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    group::{GroupMultiBroadcastInfo, GroupUserMessageIdInfo, PushPeopleType},
    offline::{
        lease::LeaseHandle,
        registry::OfflineDispatcher,
        triple::OfflineMessageKey,
    },
    push::{Notification, PushTargets},
    redis::{PartitionKey, RedisRouter, keys},
    settings::OfflineSettings,
};

/// One triple picked up by a scan.
#[derive(Clone, Debug)]
struct ScanTriple {
    key: OfflineMessageKey,
    raw: String,
}

/// The winning notification candidate for one uid within a round.
#[derive(Clone, Debug)]
struct PendingPush {
    key: OfflineMessageKey,
    info: GroupUserMessageIdInfo,
}

/// Split scan output into still-valid triples and members to remove.
/// Undecodable members are removed too; they can never be processed.
fn classify_triples(
    entries: Vec<(String, i64)>,
    now_secs: u64,
    expire_secs: u64,
) -> (Vec<ScanTriple>, Vec<String>) {
    let mut valid = Vec::new();
    let mut remove = Vec::new();
    for (member, score) in entries {
        match OfflineMessageKey::decode(&member) {
            Some(key) => {
                if now_secs.saturating_sub(score.max(0) as u64) > expire_secs {
                    remove.push(member);
                } else {
                    valid.push(ScanTriple { key, raw: member });
                }
            }
            None => {
                warn!(member, "undecodable offline triple");
                remove.push(member);
            }
        }
    }
    (valid, remove)
}

/// Merge one user record into the per-group map, preferring the record
/// with the highest `last_mid`. Historical records may live on any
/// partition, so the same uid can show up several times.
fn merge_user_record(
    map: &mut HashMap<String, GroupUserMessageIdInfo>,
    uid: String,
    info: GroupUserMessageIdInfo,
) {
    match map.get(&uid) {
        Some(existing) if existing.last_mid >= info.last_mid => {}
        _ => {
            map.insert(uid, info);
        }
    }
}

/// Whether a user record makes the user a push candidate for a triple.
fn is_candidate(
    key: &OfflineMessageKey,
    companion: &GroupMultiBroadcastInfo,
    uid: &str,
    info: &GroupUserMessageIdInfo,
) -> bool {
    if !companion.from_uid.is_empty() && uid == companion.from_uid {
        return false;
    }
    if key.push_type == PushPeopleType::ToDesignatedPerson && !companion.members.contains(uid) {
        return false;
    }
    info.last_mid < key.mid && info.wants_push() && info.is_push_capable()
}

/// Same-round dedup: the highest mid per uid wins, lower-mid candidates
/// are superseded.
fn keep_highest(
    best: &mut HashMap<String, PendingPush>,
    uid: String,
    key: OfflineMessageKey,
    info: GroupUserMessageIdInfo,
) {
    match best.get(&uid) {
        Some(existing) if existing.key.mid >= key.mid => {}
        _ => {
            best.insert(uid, PendingPush { key, info });
        }
    }
}

pub struct OfflineScanner {
    router: Arc<RedisRouter>,
    dispatcher: Arc<OfflineDispatcher>,
    lease: LeaseHandle,
    settings: OfflineSettings,
}

impl OfflineScanner {
    pub fn new(
        router: Arc<RedisRouter>,
        dispatcher: Arc<OfflineDispatcher>,
        lease: LeaseHandle,
        settings: OfflineSettings,
    ) -> Self {
        Self {
            router,
            dispatcher,
            lease,
            settings,
        }
    }

    /// Spawn the scan loop. Rounds only run while this node holds the
    /// lease.
    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.settings.scan_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if !self.lease.is_master() {
                    continue;
                }
                self.run_round(&cancel).await;
            }
        });
    }

    async fn run_round(&self, cancel: &CancellationToken) {
        let now = embercommon::time::now_secs();
        let mut best: HashMap<String, PendingPush> = HashMap::new();
        let mut users_cache: HashMap<u64, Arc<HashMap<String, GroupUserMessageIdInfo>>> =
            HashMap::new();
        let mut processed: Vec<(String, Vec<String>)> = Vec::new();

        for partition in self.router.partition_names() {
            if cancel.is_cancelled() {
                return;
            }
            match self
                .scan_partition(&partition, now, &mut best, &mut users_cache)
                .await
            {
                Ok(triples) if !triples.is_empty() => processed.push((partition, triples)),
                Ok(_) => {}
                Err(e) => warn!(partition, error = %e, "partition scan failed"),
            }
        }

        if !best.is_empty() {
            let notifications: Vec<Notification> = best
                .into_iter()
                .map(|(uid, pending)| {
                    Notification::new(
                        embercommon::identifiers::Uid::new(uid),
                        pending.key.gid,
                        pending.key.mid,
                        PushTargets::from(&pending.info),
                    )
                })
                .collect();
            info!(count = notifications.len(), "submitting offline notifications");
            self.dispatcher.dispatch(notifications).await;
        }

        // triples are only removed once their round's notifications were
        // submitted
        for (partition, triples) in processed {
            if let Err(e) = self
                .router
                .zrem(
                    PartitionKey::Named(&partition),
                    keys::GROUP_MSG_LIST,
                    &triples,
                )
                .await
            {
                warn!(partition, error = %e, "zrem of processed triples failed");
            }
        }
    }

    /// Scan one partition's queue; returns the triples that were fully
    /// processed in this round.
    async fn scan_partition(
        &self,
        partition: &str,
        now: u64,
        best: &mut HashMap<String, PendingPush>,
        users_cache: &mut HashMap<u64, Arc<HashMap<String, GroupUserMessageIdInfo>>>,
    ) -> Result<Vec<String>, crate::errors::RedisError> {
        let visible_before = now.saturating_sub(self.settings.message_delay_secs);
        let entries = self
            .router
            .zrange_by_score_below(
                PartitionKey::Named(partition),
                keys::GROUP_MSG_LIST,
                visible_before as i64,
                0,
                self.settings.scan_limit,
            )
            .await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let (valid, remove) =
            classify_triples(entries, now, self.settings.message_expire_secs);
        if !remove.is_empty() {
            debug!(partition, count = remove.len(), "dropping aged-out triples");
            self.router
                .zrem(PartitionKey::Named(partition), keys::GROUP_MSG_LIST, &remove)
                .await?;
        }

        let mut processed = Vec::new();
        for triple in valid {
            let companion = self.load_companion(&triple.key).await;
            let users = match users_cache.get(&triple.key.gid) {
                Some(users) => users.clone(),
                None => {
                    let users = Arc::new(self.collect_group_users(triple.key.gid).await?);
                    users_cache.insert(triple.key.gid, users.clone());
                    users
                }
            };
            for (uid, info) in users.iter() {
                if is_candidate(&triple.key, &companion, uid, info) {
                    keep_highest(best, uid.clone(), triple.key, info.clone());
                }
            }
            processed.push(triple.raw);
        }
        Ok(processed)
    }

    async fn load_companion(&self, key: &OfflineMessageKey) -> GroupMultiBroadcastInfo {
        let triple = key.encode();
        match self
            .router
            .hget(
                PartitionKey::Gid(key.gid),
                keys::GROUP_MULTI_MSG_LIST,
                &triple,
            )
            .await
        {
            Ok(Some(json)) => GroupMultiBroadcastInfo::from_json(&json).unwrap_or_default(),
            Ok(None) => GroupMultiBroadcastInfo::default(),
            Err(e) => {
                warn!(gid = key.gid, mid = key.mid, error = %e, "companion read failed");
                GroupMultiBroadcastInfo::default()
            }
        }
    }

    /// HSCAN the group's user hash across every partition and merge by
    /// highest last_mid. Records may live on partitions the current hash
    /// would not select; scanning only the hashed partition would miss
    /// them.
    async fn collect_group_users(
        &self,
        gid: u64,
    ) -> Result<HashMap<String, GroupUserMessageIdInfo>, crate::errors::RedisError> {
        let hash_key = keys::group_user_info_key(gid);
        let mut merged = HashMap::new();
        for partition in self.router.partition_names() {
            let mut cursor = 0u64;
            loop {
                let (next, page) = self
                    .router
                    .hscan(
                        PartitionKey::Named(&partition),
                        &hash_key,
                        cursor,
                        self.settings.user_scan_page,
                    )
                    .await?;
                for (uid, json) in page {
                    match GroupUserMessageIdInfo::from_json(&json) {
                        Some(info) => merge_user_record(&mut merged, uid, info),
                        None => warn!(gid, uid, "undecodable group user record"),
                    }
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn key(gid: u64, mid: u64, push_type: PushPeopleType) -> OfflineMessageKey {
        OfflineMessageKey {
            gid,
            mid,
            push_type,
        }
    }

    fn pushable(last_mid: u64) -> GroupUserMessageIdInfo {
        GroupUserMessageIdInfo {
            last_mid,
            apn_id: "apn".into(),
            ..Default::default()
        }
    }

    #[test]
    fn classify_drops_expired_and_garbage() {
        let now = 10_000;
        let fresh = key(1, 2, PushPeopleType::ToAll).encode();
        let stale = key(1, 1, PushPeopleType::ToAll).encode();
        let entries = vec![
            (fresh.clone(), (now - 60) as i64),
            (stale.clone(), (now - 7200) as i64),
            ("garbage".to_string(), (now - 60) as i64),
        ];
        let (valid, remove) = classify_triples(entries, now, 1800);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].raw, fresh);
        assert_eq!(remove, vec![stale, "garbage".to_string()]);
    }

    #[test]
    fn merge_prefers_highest_last_mid() {
        let mut map = HashMap::new();
        merge_user_record(&mut map, "u1".into(), pushable(5));
        merge_user_record(&mut map, "u1".into(), pushable(3));
        assert_eq!(map["u1"].last_mid, 5);
        merge_user_record(&mut map, "u1".into(), pushable(9));
        assert_eq!(map["u1"].last_mid, 9);
    }

    #[test]
    fn candidate_filter_applies_all_rules() {
        let k = key(1, 10, PushPeopleType::ToAll);
        let companion = GroupMultiBroadcastInfo {
            members: BTreeSet::new(),
            from_uid: "sender".into(),
        };

        // behind and pushable: candidate
        assert!(is_candidate(&k, &companion, "u1", &pushable(5)));
        // caught up
        assert!(!is_candidate(&k, &companion, "u1", &pushable(10)));
        // the sender never gets pushed
        assert!(!is_candidate(&k, &companion, "sender", &pushable(0)));
        // opted out
        let mut opted_out = pushable(0);
        opted_out.cfg_flag = crate::group::CFG_FLAG_NO_CONFIG;
        assert!(!is_candidate(&k, &companion, "u1", &opted_out));
        // no push registration at all
        assert!(!is_candidate(&k, &companion, "u1", &GroupUserMessageIdInfo {
            last_mid: 0,
            ..Default::default()
        }));
    }

    #[test]
    fn designated_triples_only_reach_the_member_set() {
        let k = key(1, 10, PushPeopleType::ToDesignatedPerson);
        let companion = GroupMultiBroadcastInfo {
            members: BTreeSet::from(["u1".to_string(), "u2".to_string()]),
            from_uid: "u2".into(),
        };
        assert!(is_candidate(&k, &companion, "u1", &pushable(0)));
        // in the set but the sender
        assert!(!is_candidate(&k, &companion, "u2", &pushable(0)));
        // not in the set
        assert!(!is_candidate(&k, &companion, "u3", &pushable(0)));
    }

    #[test]
    fn round_dedup_keeps_highest_mid() {
        let mut best = HashMap::new();
        keep_highest(&mut best, "u1".into(), key(1, 5, PushPeopleType::ToAll), pushable(0));
        keep_highest(&mut best, "u1".into(), key(1, 9, PushPeopleType::ToAll), pushable(0));
        keep_highest(&mut best, "u1".into(), key(2, 7, PushPeopleType::ToAll), pushable(0));
        assert_eq!(best.len(), 1);
        assert_eq!(best["u1"].key.mid, 9);
    }
}
