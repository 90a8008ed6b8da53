//! Core identifier types for the ondemand scaler.
//!
//! Node, allocation and evaluation ids are assigned by the cluster manager
//! (UUID strings). Ephemeral entries created while scaling get locally
//! generated UUIDs of the same shape so both kinds share one key space.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an id assigned elsewhere.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random id.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Return the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the first dash-separated segment, used for compact display.
            #[must_use]
            pub fn short(&self) -> &str {
                self.0.split('-').next().unwrap_or(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a cluster node.
    NodeId
);

string_id!(
    /// Identifier of an allocation (one placed instance of a task group).
    AllocId
);

string_id!(
    /// Identifier of a scheduling evaluation.
    EvalId
);

/// Identity of an eval chain: one chain per (namespace, job id).
///
/// Also used as the scaling queue key and the scaling event id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    namespace: String,
    job_id: String,
}

impl ChainKey {
    /// Create a chain key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            job_id: job_id.into(),
        }
    }

    /// Namespace part of the key.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Job id part of the key.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainKey({}/{})", self.namespace, self.job_id)
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_generate_is_uuid() {
        let id = NodeId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn node_id_short() {
        let id = NodeId::new("6a1f9c2e-0000-4000-8000-000000000000");
        assert_eq!(id.short(), "6a1f9c2e");

        let plain = NodeId::new("node1");
        assert_eq!(plain.short(), "node1");
    }

    #[test]
    fn ids_debug_and_display() {
        let id = AllocId::new("a1");
        assert_eq!(format!("{id}"), "a1");
        assert_eq!(format!("{id:?}"), "AllocId(a1)");
    }

    #[test]
    fn ids_serde_transparent() {
        let id = EvalId::new("e1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"e1\"");
        let parsed: EvalId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn chain_key_display() {
        let key = ChainKey::new("prod", "api");
        assert_eq!(key.to_string(), "prod/api");
        assert_eq!(key.namespace(), "prod");
        assert_eq!(key.job_id(), "api");
    }

    #[test]
    fn chain_key_equality() {
        assert_eq!(ChainKey::new("a", "b"), ChainKey::new("a", "b"));
        assert_ne!(ChainKey::new("a", "b"), ChainKey::new("b", "a"));
    }
}
