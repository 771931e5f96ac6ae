//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height.
///
/// Signed so that [`Height::NIL`] can mark "no block yet"; every stored block
/// has a height of at least [`Height::GENESIS`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(pub i64);

impl Height {
    /// Genesis block height.
    pub const GENESIS: Self = Height(0);

    /// Height before genesis.
    pub const NIL: Self = Height(-1);

    /// Get the next block height.
    pub fn next(self) -> Self {
        Height(self.0 + 1)
    }

    /// Get the previous height, never going below [`Height::NIL`].
    pub fn prev(self) -> Self {
        if self.0 > Self::NIL.0 {
            Height(self.0 - 1)
        } else {
            Self::NIL
        }
    }

    /// True for [`Height::NIL`] and anything below it.
    pub fn is_nil(self) -> bool {
        self.0 <= Self::NIL.0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consensus round within a height.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Round(pub u64);

impl Round {
    /// Get the next round.
    pub fn next(self) -> Self {
        Round(self.0 + 1)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node address.
///
/// The stable identity of a consensus node. During handover two processes
/// share one address and one key pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(pub String);

impl NodeAddress {
    /// Create an address from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network identifier mixed into every signature for replay protection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl NetworkId {
    /// Create a network id.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Raw bytes used in signing messages.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection info of a node process (`host:port`).
///
/// Distinguishes the handover X and Y processes, which share a node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnInfo(pub String);

impl ConnInfo {
    /// Create conn info.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
