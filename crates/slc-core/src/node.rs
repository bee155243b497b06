//! Node identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Maximum length of a node name in bytes (the registry's node-name limit).
pub const MAX_NODE_NAME_LEN: usize = 31;

/// Name of a control node within a registry domain.
///
/// Validated on construction: non-empty, at most [`MAX_NODE_NAME_LEN`]
/// bytes, ASCII alphanumerics plus `_`, `-` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(String);

/// Reasons a node name is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeNameError {
    #[error("node name is empty")]
    Empty,

    #[error("node name '{name}' is longer than {max} bytes")]
    TooLong { name: String, max: usize },

    #[error("node name '{name}' contains invalid character {ch:?}")]
    InvalidChar { name: String, ch: char },
}

impl NodeName {
    /// Creates a validated node name.
    pub fn new(name: impl Into<String>) -> Result<Self, NodeNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NodeNameError::Empty);
        }
        if name.len() > MAX_NODE_NAME_LEN {
            return Err(NodeNameError::TooLong {
                name,
                max: MAX_NODE_NAME_LEN,
            });
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(NodeNameError::InvalidChar { name, ch });
        }
        Ok(Self(name))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeName {
    type Error = NodeNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for NodeName {
    type Error = NodeNameError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0
    }
}

impl AsRef<str> for NodeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Handle identifying one control node.
///
/// Immutable once constructed; used to address commands and to tag
/// published status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    name: NodeName,
}

impl NodeIdentity {
    pub fn new(name: NodeName) -> Self {
        Self { name }
    }

    /// Parses and validates `name` into an identity.
    pub fn parse(name: &str) -> Result<Self, NodeNameError> {
        NodeName::new(name).map(Self::new)
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(NodeName::new("HV_ARICH").is_ok());
        assert!(NodeName::new("cpr5001").is_ok());
        assert!(NodeName::new("ttd-3.main").is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(NodeName::new(""), Err(NodeNameError::Empty));
    }

    #[test]
    fn test_long_name_rejected() {
        let name = "N".repeat(MAX_NODE_NAME_LEN + 1);
        assert!(matches!(
            NodeName::new(name),
            Err(NodeNameError::TooLong { max: MAX_NODE_NAME_LEN, .. })
        ));
        assert!(NodeName::new("N".repeat(MAX_NODE_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_invalid_char_rejected() {
        let err = NodeName::new("HV ARICH").unwrap_err();
        assert!(matches!(err, NodeNameError::InvalidChar { ch: ' ', .. }));
    }

    #[test]
    fn test_identity_display() {
        let identity = NodeIdentity::parse("HV_ARICH").unwrap();
        assert_eq!(identity.to_string(), "HV_ARICH");
        assert_eq!(identity.name().as_str(), "HV_ARICH");
    }

    #[test]
    fn test_name_deserialize_validates() {
        let ok: Result<NodeName, _> = serde_json::from_str("\"HV_ARICH\"");
        assert!(ok.is_ok());
        let bad: Result<NodeName, _> = serde_json::from_str("\"bad name\"");
        assert!(bad.is_err());
    }
}
