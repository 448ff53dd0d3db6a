//! Validated node identifiers
//!
//! Node IDs are interpolated into broker channel names and HTTP paths, so
//! anything outside `^[A-Za-z0-9._-]{1,64}$` is rejected before use.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static NODE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("valid regex"));

/// A node identifier that is safe to embed in channel names and paths
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Validate and wrap a node identifier
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the identifier fails the allowed pattern
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if NODE_ID_PATTERN.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(Error::Validation(format!(
                "invalid node id {id:?}: must be 1-64 alphanumeric characters, dots, hyphens, or underscores"
            )))
        }
    }

    /// Check a raw string against the node ID pattern
    #[must_use]
    pub fn is_valid(id: &str) -> bool {
        NODE_ID_PATTERN.is_match(id)
    }

    /// Borrow the identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
