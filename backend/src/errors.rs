// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("error deserializing column: {0}")]
    Serde(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.into())
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Dynamic(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Error talking to the partitioned Redis layer.
#[derive(Debug, Error)]
pub enum RedisError {
    /// All replicas of the selected partition failed the operation.
    #[error("all replicas of partition {partition} failed: {last_error}")]
    AllReplicasFailed {
        partition: String,
        last_error: String,
    },
    #[error("no partition configured for key")]
    NoPartition,
    #[error("unexpected reply type for {command}")]
    UnexpectedReply { command: &'static str },
    #[error(transparent)]
    Driver(#[from] redis::RedisError),
}
