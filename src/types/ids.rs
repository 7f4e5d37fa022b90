//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Agent identity in the registry: `<host>-<node>` or `<node>`.
define_id!(AgentKey);
// One execution of a claimed job.
define_id!(RunId, uuid);

impl AgentKey {
    /// Build the registry key for a node, prefixed by its host when they differ.
    pub fn for_node(node: &str, host: Option<&str>) -> Result<Self, &'static str> {
        match host {
            Some(host) if host != node => Self::from_string(format!("{}-{}", host, node)),
            _ => Self::from_string(node.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_id_rejected() {
        assert!(AgentKey::from_string(String::new()).is_err());
    }

    #[test]
    fn test_agent_key_for_node() {
        let plain = AgentKey::for_node("n1", None).unwrap();
        assert_eq!(plain.as_str(), "n1");
        let same = AgentKey::for_node("n1", Some("n1")).unwrap();
        assert_eq!(same.as_str(), "n1");
        let hosted = AgentKey::for_node("n1", Some("login")).unwrap();
        assert_eq!(hosted.as_str(), "login-n1");
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
