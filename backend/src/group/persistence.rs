// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Narrow DAO over the durable group store.
//!
//! Message ids are assigned here: an insert bumps the group's `last_mid`
//! inside the same transaction as the message row, which is what makes mids
//! monotone per group across the cluster.

use sqlx::{PgPool, Row, postgres::PgRow};

use crate::errors::StorageError;

use super::{Group, GroupMsg, GroupMsgStatus, GroupMsgType, Role};

/// A new message as handed to [`GroupStorage::insert_message`]; the mid is
/// assigned by the store.
#[derive(Clone, Debug)]
pub struct NewGroupMsg {
    pub gid: u64,
    pub from_uid: String,
    pub msg_type: GroupMsgType,
    pub text: String,
    pub at_list: Vec<String>,
    pub at_all: bool,
    pub source_extra: String,
    pub verify_sig: String,
    pub create_time_ms: u64,
}

#[derive(Clone)]
pub struct GroupStorage {
    pool: PgPool,
}

fn msg_from_row(row: &PgRow) -> Result<GroupMsg, StorageError> {
    let at_list: serde_json::Value = row.try_get("at_list")?;
    let at_list = serde_json::from_value(at_list)
        .map_err(|e| StorageError::Serde(e.to_string()))?;
    let msg_type = GroupMsgType::from_i16(row.try_get("msg_type")?)
        .ok_or_else(|| StorageError::Serde("unknown message type".into()))?;
    let status = GroupMsgStatus::from_i16(row.try_get("status")?)
        .ok_or_else(|| StorageError::Serde("unknown message status".into()))?;
    Ok(GroupMsg {
        gid: row.try_get::<i64, _>("gid")? as u64,
        mid: row.try_get::<i64, _>("mid")? as u64,
        from_uid: row.try_get("from_uid")?,
        msg_type,
        text: row.try_get("text")?,
        status,
        at_list,
        at_all: row.try_get("at_all")?,
        source_extra: row.try_get("source_extra")?,
        verify_sig: row.try_get("verify_sig")?,
        create_time_ms: row.try_get::<i64, _>("create_time_ms")? as u64,
    })
}

impl GroupStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_group(&self, gid: u64) -> Result<Option<Group>, StorageError> {
        let row = sqlx::query(
            "SELECT gid, last_mid, broadcast, encrypted FROM groups WHERE gid = $1",
        )
        .bind(gid as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Group {
                gid: row.try_get::<i64, _>("gid")? as u64,
                last_mid: row.try_get::<i64, _>("last_mid")? as u64,
                broadcast: row.try_get("broadcast")?,
                encrypted: row.try_get("encrypted")?,
            })
        })
        .transpose()
    }

    pub async fn get_member_role(&self, gid: u64, uid: &str) -> Result<Option<Role>, StorageError> {
        let row = sqlx::query("SELECT role FROM group_users WHERE gid = $1 AND uid = $2")
            .bind(gid as i64)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Role::from_i16(row.try_get("role")?)
                .ok_or_else(|| StorageError::Serde("unknown role".into()))
        })
        .transpose()
    }

    pub async fn list_member_uids(&self, gid: u64) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT uid FROM group_users WHERE gid = $1 ORDER BY uid")
            .bind(gid as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("uid").map_err(Into::into))
            .collect()
    }

    /// Groups a uid belongs to; used to refresh push snapshots on token
    /// registration.
    pub async fn list_groups_of(&self, uid: &str) -> Result<Vec<u64>, StorageError> {
        let rows = sqlx::query("SELECT gid FROM group_users WHERE uid = $1 ORDER BY gid")
            .bind(uid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("gid")? as u64))
            .collect()
    }

    /// Insert a message, atomically assigning the next mid of the group.
    pub async fn insert_message(&self, msg: &NewGroupMsg) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mid: i64 = sqlx::query(
            "UPDATE groups SET last_mid = last_mid + 1 WHERE gid = $1 RETURNING last_mid",
        )
        .bind(msg.gid as i64)
        .fetch_one(&mut *tx)
        .await?
        .try_get("last_mid")?;

        sqlx::query(
            "INSERT INTO group_msgs \
             (gid, mid, from_uid, msg_type, text, status, at_list, at_all, \
              source_extra, verify_sig, create_time_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(msg.gid as i64)
        .bind(mid)
        .bind(&msg.from_uid)
        .bind(msg.msg_type.as_i16())
        .bind(&msg.text)
        .bind(GroupMsgStatus::Normal.as_i16())
        .bind(serde_json::to_value(&msg.at_list).map_err(|e| StorageError::Serde(e.to_string()))?)
        .bind(msg.at_all)
        .bind(&msg.source_extra)
        .bind(&msg.verify_sig)
        .bind(msg.create_time_ms as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(mid as u64)
    }

    pub async fn get_message(&self, gid: u64, mid: u64) -> Result<Option<GroupMsg>, StorageError> {
        let row = sqlx::query(
            "SELECT gid, mid, from_uid, msg_type, text, status, at_list, at_all, \
             source_extra, verify_sig, create_time_ms \
             FROM group_msgs WHERE gid = $1 AND mid = $2",
        )
        .bind(gid as i64)
        .bind(mid as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(msg_from_row).transpose()
    }

    /// Mark a message recalled and insert the recall marker in one
    /// transaction. Returns the marker's mid.
    pub async fn recall_message(
        &self,
        gid: u64,
        recalled_mid: u64,
        marker: &NewGroupMsg,
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE group_msgs SET status = $1 WHERE gid = $2 AND mid = $3")
            .bind(GroupMsgStatus::Recalled.as_i16())
            .bind(gid as i64)
            .bind(recalled_mid as i64)
            .execute(&mut *tx)
            .await?;

        let mid: i64 = sqlx::query(
            "UPDATE groups SET last_mid = last_mid + 1 WHERE gid = $1 RETURNING last_mid",
        )
        .bind(gid as i64)
        .fetch_one(&mut *tx)
        .await?
        .try_get("last_mid")?;

        sqlx::query(
            "INSERT INTO group_msgs \
             (gid, mid, from_uid, msg_type, text, status, at_list, at_all, \
              source_extra, verify_sig, create_time_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(gid as i64)
        .bind(mid)
        .bind(&marker.from_uid)
        .bind(GroupMsgType::Recall.as_i16())
        .bind(&marker.text)
        .bind(GroupMsgStatus::Normal.as_i16())
        .bind(serde_json::Value::Array(Vec::new()))
        .bind(false)
        .bind(&marker.source_extra)
        .bind(&marker.verify_sig)
        .bind(marker.create_time_ms as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(mid as u64)
    }

    /// Fetch up to `limit` messages in `(from, to]` mid order. Clients that
    /// pre-date recall never see the recall markers.
    pub async fn fetch_messages(
        &self,
        gid: u64,
        from_mid: u64,
        to_mid: u64,
        limit: usize,
        supports_recall: bool,
    ) -> Result<Vec<GroupMsg>, StorageError> {
        let rows = sqlx::query(
            "SELECT gid, mid, from_uid, msg_type, text, status, at_list, at_all, \
             source_extra, verify_sig, create_time_ms \
             FROM group_msgs \
             WHERE gid = $1 AND mid > $2 AND mid <= $3 \
             ORDER BY mid ASC LIMIT $4",
        )
        .bind(gid as i64)
        .bind(from_mid as i64)
        .bind(to_mid as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let msg = msg_from_row(row)?;
            if !supports_recall && msg.msg_type == GroupMsgType::Recall {
                continue;
            }
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Raise the member's last-acked mid. Idempotent; a stale ack never
    /// lowers it.
    pub async fn update_last_ack(
        &self,
        gid: u64,
        uid: &str,
        last_ack_mid: u64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE group_users SET last_ack_mid = GREATEST(last_ack_mid, $3) \
             WHERE gid = $1 AND uid = $2",
        )
        .bind(gid as i64)
        .bind(uid)
        .bind(last_ack_mid as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
