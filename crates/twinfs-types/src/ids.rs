//! Identifier newtypes.
//!
//! Raw integers cross the wire, but inside the node a namespace id and a
//! block id must never be interchangeable. `id_type!` wraps each in its own
//! tuple struct; the wrapper derefs to the raw integer for logging and
//! arithmetic and serializes transparently.

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident($raw:ty)) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $raw);

        impl ::std::ops::Deref for $name {
            type Target = $raw;

            fn deref(&self) -> &$raw {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_type! {
    /// Identifies one namespace; assigned by its metadata servers at
    /// handshake, 0 until then.
    NamespaceId(u32)
}

id_type! {
    /// Fixed identity of a block, stable across replicas.
    BlockId(u64)
}

id_type! {
    /// Monotonic stamp bumped on every block recovery.
    GenerationStamp(u64)
}

impl NamespaceId {
    /// The "not yet assigned" sentinel. A namespace id is handed out by the
    /// metadata server during the handshake; until then the pair carries 0.
    pub const UNSET: NamespaceId = NamespaceId(0);

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_namespace_id_unset() {
        assert!(!NamespaceId::UNSET.is_set());
        assert!(NamespaceId(42).is_set());
        assert_eq!(NamespaceId::default(), NamespaceId::UNSET);
    }

    #[test]
    fn test_deref_and_display() {
        let id = BlockId(9001);
        assert_eq!(*id, 9001u64);
        assert_eq!(format!("{}", id), "9001");
        assert_eq!(format!("{:?}", id), "BlockId(9001)");
    }

    #[test]
    fn test_ids_are_distinct_types_in_maps() {
        let mut seen = HashSet::new();
        seen.insert(NamespaceId(1));
        seen.insert(NamespaceId(2));
        seen.insert(NamespaceId(1));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_transparent_serde() {
        let id = NamespaceId(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "7");
        let parsed: NamespaceId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, id);

        let stamp: GenerationStamp = serde_json::from_str("1001").unwrap();
        assert_eq!(stamp, GenerationStamp(1001));
    }
}
