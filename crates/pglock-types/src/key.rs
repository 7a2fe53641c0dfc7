//! Advisory lock identifiers.
//!
//! Integer keys pass through unchanged. String keys are hashed with SHA-256;
//! the first eight digest bytes are read as a little-endian `i64`. The scheme
//! must stay bit-for-bit stable: deployments already hold locks under ids
//! derived this way.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of an advisory lock, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockKey {
    Id(i64),
    Name(String),
}

impl LockKey {
    /// The 64-bit key handed to `pg_advisory_*`.
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Id(id) => *id,
            Self::Name(name) => hash_name(name),
        }
    }

    /// `(classid, objid)` as reported by `pg_locks` for this key.
    #[must_use]
    pub fn advisory_id(&self) -> (i64, i64) {
        split_id(self.id())
    }

    /// An empty name cannot identify anything.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Name(name) if name.is_empty())
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for LockKey {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<i32> for LockKey {
    fn from(id: i32) -> Self {
        Self::Id(i64::from(id))
    }
}

impl From<u32> for LockKey {
    fn from(id: u32) -> Self {
        Self::Id(i64::from(id))
    }
}

impl From<&str> for LockKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for LockKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Given a lock key, return the `(classid, objid)` pair Postgres shows in
/// `pg_locks` for the advisory lock.
pub fn advisory_id(key: impl Into<LockKey>) -> (i64, i64) {
    key.into().advisory_id()
}

fn hash_name(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(head)
}

fn split_id(id: i64) -> (i64, i64) {
    (id >> 32, id & 0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn max_id_splits_into_halves() {
        assert_eq!(advisory_id(i64::MAX), (2_147_483_647, 4_294_967_295));
    }

    #[test]
    fn negative_id_keeps_sign_in_class() {
        assert_eq!(advisory_id(-1_i64), (-1, 4_294_967_295));
    }

    #[test]
    fn string_ids_match_known_vectors() {
        assert_eq!(LockKey::from("hello").id(), 1_054_880_662_928_880_172);
        assert_eq!(advisory_id("hello"), (245_608_543, 3_125_670_444));
        assert_eq!(
            advisory_id("my_app.tasks.refresh"),
            (1_013_255_939, 2_099_820_301)
        );
    }

    #[test]
    fn integer_ids_pass_through() {
        assert_eq!(LockKey::from(42_i32).id(), 42);
        assert_eq!(LockKey::from(7_u32).id(), 7);
    }

    #[test]
    fn empty_name_is_missing() {
        assert!(LockKey::from("").is_missing());
        assert!(!LockKey::from(0_i64).is_missing());
    }

    #[test]
    fn serde_is_untagged() {
        let key: LockKey = serde_json::from_str("\"jobs\"").unwrap();
        assert_eq!(key, LockKey::Name("jobs".to_owned()));
        let key: LockKey = serde_json::from_str("12").unwrap();
        assert_eq!(key, LockKey::Id(12));
    }

    proptest! {
        #[test]
        fn name_hash_is_deterministic(name in ".{0,64}") {
            prop_assert_eq!(advisory_id(name.as_str()), advisory_id(name.clone()));
        }

        #[test]
        fn halves_recombine(id in any::<i64>()) {
            let (class_id, object_id) = advisory_id(id);
            prop_assert!((0..=0xFFFF_FFFF).contains(&object_id));
            prop_assert_eq!((class_id << 32) | object_id, id);
        }
    }
}
