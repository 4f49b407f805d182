//! Identifier types used across the trisum network.
//!
//! Nodes and computations are referenced everywhere by opaque ids; peers are
//! never handed object references across node boundaries. Both ids render to
//! a stable prefixed string form, which is also the persisted representation.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a node (coordinator or contributor).
///
/// Renders as `node-<token>`; the rendered form is what the registry stores
/// and what appears in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0.simple())
    }
}

impl FromStr for NodeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.strip_prefix("node-").ok_or(IdParseError::MissingPrefix {
            expected: "node-",
        })?;
        let uuid = Uuid::parse_str(token).map_err(|_| IdParseError::MalformedToken)?;
        Ok(Self(uuid))
    }
}

/// Unique identifier of a computation.
///
/// Renders as `COMP-<token>`, the form returned to façade callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputationId(Uuid);

impl ComputationId {
    /// Create a new random computation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ComputationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COMP-{}", self.0.simple())
    }
}

impl FromStr for ComputationId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.strip_prefix("COMP-").ok_or(IdParseError::MissingPrefix {
            expected: "COMP-",
        })?;
        let uuid = Uuid::parse_str(token).map_err(|_| IdParseError::MalformedToken)?;
        Ok(Self(uuid))
    }
}

/// Failure to parse a rendered identifier back into its typed form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("identifier is missing the '{expected}' prefix")]
    MissingPrefix { expected: &'static str },

    #[error("identifier token is not a valid UUID")]
    MalformedToken,
}

// Both ids serialize as their rendered string form so that the wire format,
// the registry, and log output all agree on one representation.

macro_rules! string_form_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

string_form_serde!(NodeId);
string_form_serde!(ComputationId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_display() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn computation_id_uses_comp_prefix() {
        let id = ComputationId::new();
        assert!(id.to_string().starts_with("COMP-"));
        let parsed: ComputationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let id = NodeId::new();
        assert!(id.to_string().parse::<ComputationId>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let id = ComputationId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: ComputationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
