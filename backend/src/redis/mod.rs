// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Partitioned Redis access.
//!
//! Callers never pick a replica themselves: every operation names a
//! partition key (numeric group id or string hash key), the consistent hash
//! selects the partition, and the router works through the partition's
//! replicas in failover order.

pub mod hash_ring;
pub mod keys;
pub mod pubsub;
pub mod router;

pub use router::{PartitionKey, RedisRouter};
