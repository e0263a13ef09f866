//! Identifier types
//!
//! Commands carry two identifiers: a [`CommandId`] that names exactly one
//! command, and a [`CommandToken`] that encodes its lineage. A root token is
//! the root command's id; a child token is `"{parent_token}.{child_id}"`, so
//! ancestry checks still work after a command crossed a transport.
//!
//! Kernels are addressed by [`KernelUri`].

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MeshError, Result};

/// Unique identifier for a single command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lineage-bearing command token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandToken(String);

impl CommandToken {
    /// Token of a root command
    pub fn root(id: &CommandId) -> Self {
        Self(id.as_str().to_string())
    }

    /// Token of a command issued beneath `parent`
    pub fn child(parent: &CommandToken, id: &CommandId) -> Self {
        Self(format!("{}.{}", parent.0, id.as_str()))
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token of the root command of this lineage
    pub fn root_token(&self) -> CommandToken {
        match self.0.split_once('.') {
            Some((root, _)) => Self(root.to_string()),
            None => self.clone(),
        }
    }

    /// True if this token is `other` or was derived from it
    pub fn is_self_or_descendant_of(&self, other: &CommandToken) -> bool {
        self.0 == other.0
            || (self.0.len() > other.0.len()
                && self.0.starts_with(&other.0)
                && self.0.as_bytes()[other.0.len()] == b'.')
    }
}

impl std::fmt::Display for CommandToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized absolute kernel address, `scheme://authority/path`
///
/// Query and fragment are dropped; an empty path becomes `/`, so
/// `kernel://local` and `kernel://local/` are the same kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelUri(String);

impl KernelUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: String| MeshError::InvalidKernelUri {
            uri: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing authority".to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let path = if url.path().is_empty() { "/" } else { url.path() };
        Ok(Self(format!("{}://{}{}", url.scheme(), authority, path)))
    }

    /// Default address of a kernel that has not been placed in a composite
    pub fn local(name: &str) -> Result<Self> {
        Self::parse(&format!("kernel://local/{}", name))
    }

    /// Address of a child kernel named `name` below this one
    pub fn join(&self, name: &str) -> Result<Self> {
        let base = if self.0.ends_with('/') {
            self.0.clone()
        } else {
            format!("{}/", self.0)
        };
        Self::parse(&format!("{}{}", base, name))
    }

    /// True if `self` equals `base` or sits below it
    pub fn is_within(&self, base: &KernelUri) -> bool {
        if self == base {
            return true;
        }
        let prefix = if base.0.ends_with('/') {
            base.0.clone()
        } else {
            format!("{}/", base.0)
        };
        self.0.starts_with(&prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for KernelUri {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<KernelUri> for String {
    fn from(uri: KernelUri) -> Self {
        uri.0
    }
}

impl std::str::FromStr for KernelUri {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for KernelUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_normalizes_empty_path() {
        let uri = KernelUri::parse("kernel://a").unwrap();
        assert_eq!(uri.as_str(), "kernel://a/");
        assert_eq!(uri, KernelUri::parse("kernel://a/").unwrap());
    }

    #[test]
    fn test_uri_drops_query_and_fragment() {
        let uri = KernelUri::parse("kernel://local/csharp?tag=arrived#x").unwrap();
        assert_eq!(uri.as_str(), "kernel://local/csharp");
    }

    #[test]
    fn test_uri_rejects_missing_authority() {
        let err = KernelUri::parse("csharp").unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_uri_join_and_containment() {
        let host = KernelUri::parse("kernel://remote").unwrap();
        let child = host.join("csharp").unwrap();
        assert_eq!(child.as_str(), "kernel://remote/csharp");
        assert!(child.is_within(&host));
        assert!(!host.is_within(&child));
        let dotnet = KernelUri::local(".NET").unwrap();
        assert_eq!(dotnet.as_str(), "kernel://local/.NET");
    }

    #[test]
    fn test_token_lineage() {
        let root_id = CommandId::new();
        let root = CommandToken::root(&root_id);
        let child = CommandToken::child(&root, &CommandId::new());
        let grandchild = CommandToken::child(&child, &CommandId::new());

        assert!(grandchild.is_self_or_descendant_of(&root));
        assert!(grandchild.is_self_or_descendant_of(&child));
        assert!(!root.is_self_or_descendant_of(&child));
        assert_eq!(grandchild.root_token(), root);

        let unrelated = CommandToken::root(&CommandId::from_string(format!("{}x", root_id)));
        assert!(!unrelated.is_self_or_descendant_of(&root));
    }
}
