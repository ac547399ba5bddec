// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The encoded member of the offline sorted set.

use crate::group::PushPeopleType;

/// `(gid, mid, push people type)` as stored in `group_msg_list`:
/// `<gid:020>_<mid:020>_<type:02>`, 44 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineMessageKey {
    pub gid: u64,
    pub mid: u64,
    pub push_type: PushPeopleType,
}

impl OfflineMessageKey {
    pub fn encode(&self) -> String {
        format!(
            "{:020}_{:020}_{:02}",
            self.gid,
            self.mid,
            self.push_type.as_u8()
        )
    }

    pub fn decode(member: &str) -> Option<Self> {
        let mut parts = member.split('_');
        let gid = parts.next()?.parse().ok()?;
        let mid = parts.next()?.parse().ok()?;
        let push_type = PushPeopleType::from_u8(parts.next()?.parse().ok()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            gid,
            mid,
            push_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fixed_width() {
        let key = OfflineMessageKey {
            gid: 42,
            mid: 7,
            push_type: PushPeopleType::ToAll,
        };
        let encoded = key.encode();
        assert_eq!(encoded.len(), 44);
        assert_eq!(
            encoded,
            "00000000000000000042_00000000000000000007_01"
        );
        assert_eq!(OfflineMessageKey::decode(&encoded), Some(key));
    }

    #[test]
    fn decode_rejects_malformed_members() {
        assert!(OfflineMessageKey::decode("").is_none());
        assert!(OfflineMessageKey::decode("1_2").is_none());
        assert!(OfflineMessageKey::decode("a_b_c").is_none());
        assert!(OfflineMessageKey::decode("1_2_99").is_none());
        assert!(OfflineMessageKey::decode("1_2_01_extra").is_none());
    }

    #[test]
    fn decode_tolerates_unpadded_numbers() {
        let key = OfflineMessageKey::decode("5_6_02").unwrap();
        assert_eq!(key.gid, 5);
        assert_eq!(key.mid, 6);
        assert_eq!(key.push_type, PushPeopleType::ToDesignatedPerson);
    }
}
