//! Aggregate identifiers.
//!
//! Aggregate ids are ULIDs: lexicographically sortable, timestamp-prefixed,
//! stored as 26-character text. Ephemeral ids (lock leases) use UUID v4 and
//! live where they are minted.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            pub fn parse(raw: &str) -> Option<Self> {
                Ulid::from_string(raw).ok().map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// A task aggregate id.
    TaskId
);
ulid_id!(
    /// A user id.
    UserId
);
ulid_id!(
    /// A proof id.
    ProofId
);
ulid_id!(
    /// An outbox event id.
    EventId
);
ulid_id!(
    /// A correction id.
    CorrectionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_text() {
        let id = TaskId::generate();
        let parsed = TaskId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TaskId::parse("not-a-ulid").is_none());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = UserId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
