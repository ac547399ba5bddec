// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Proof of work for account signup.
//!
//! The server hands out `(nonce, difficulty)`; the client must find a 32-bit
//! counter such that the double SHA-256 of
//! `"BCM" ‖ uid ‖ be32(nonce) ‖ be32(difficulty) ‖ be32(counter)`, read as a
//! big-endian u32, is below `2^(32 - difficulty)`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::time::now_secs;

const POW_PREFIX: &[u8] = b"BCM";

/// A pending signup challenge for one uid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: u32,
    pub difficulty: u32,
    /// Unix seconds at which the challenge was issued.
    pub issued_at: u64,
}

impl Challenge {
    pub fn issue(difficulty: u32) -> Self {
        Self {
            nonce: rand::thread_rng().gen_range(0..u32::MAX),
            difficulty,
            issued_at: now_secs(),
        }
    }

    pub fn is_expired(&self, ttl_secs: u64) -> bool {
        now_secs().saturating_sub(self.issued_at) > ttl_secs
    }
}

fn puzzle_value(uid: &str, nonce: u32, difficulty: u32, counter: u32) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(POW_PREFIX);
    hasher.update(uid.as_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(difficulty.to_be_bytes());
    hasher.update(counter.to_be_bytes());
    let first = hasher.finalize();
    let second = Sha256::digest(first);
    u32::from_be_bytes(second[..4].try_into().expect("digest is 32 bytes"))
}

/// Verify a client-supplied counter against a challenge.
pub fn verify_counter(uid: &str, nonce: u32, difficulty: u32, counter: u32) -> bool {
    if difficulty == 0 || difficulty > 32 {
        return false;
    }
    let threshold = if difficulty == 32 {
        1
    } else {
        1u32 << (32 - difficulty)
    };
    puzzle_value(uid, nonce, difficulty, counter) < threshold
}

/// Brute-force a valid counter. Only sensible for small difficulties.
pub fn find_counter(uid: &str, nonce: u32, difficulty: u32) -> Option<u32> {
    (0..=u32::MAX).find(|&counter| verify_counter(uid, nonce, difficulty, counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_counter_verifies() {
        let counter = find_counter("alice", 42, 4).unwrap();
        assert!(verify_counter("alice", 42, 4, counter));
    }

    #[test]
    fn counter_is_bound_to_uid_and_nonce() {
        let counter = find_counter("alice", 42, 8).unwrap();
        // With 8 leading zero bits required, a counter found for one input
        // is overwhelmingly unlikely to satisfy a different one.
        let cross = verify_counter("bob", 42, 8, counter)
            && verify_counter("alice", 43, 8, counter);
        assert!(!cross);
    }

    #[test]
    fn out_of_range_difficulty_rejected() {
        assert!(!verify_counter("alice", 1, 0, 0));
        assert!(!verify_counter("alice", 1, 33, 0));
    }

    #[test]
    fn challenge_expiry() {
        let mut challenge = Challenge::issue(8);
        assert!(!challenge.is_expired(60));
        challenge.issued_at -= 120;
        assert!(challenge.is_expired(60));
    }
}
