//! Shared value types for the tunnel manager and everything that observes it.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, opaque identifier of a configured tunnel.
///
/// Assigned when the entry is created and immutable afterwards. Ids are never
/// reused, not even after the entry has been removed. List indices, by
/// contrast, shift whenever earlier entries are removed or reordered and must
/// never be treated as identities.
#[derive(Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TunnelId(uuid::Uuid);

impl TunnelId {
    pub const fn from_u128(v: u128) -> Self {
        Self(uuid::Uuid::from_u128(v))
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::str::FromStr for TunnelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Runtime connection state of a tunnel.
///
/// Only the activation driver writes this, never UI-initiated calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TunnelStatus {
    #[default]
    Inactive,
    Activating,
    Active,
    Deactivating,
    /// Being torn down with a re-activation queued behind the teardown.
    Restarting,
    /// The underlying network path is being re-established without a full
    /// deactivation.
    Reasserting,
    /// Activation failed. Transient: resets to [`TunnelStatus::Inactive`]
    /// after a grace period, retaining the reason for display until then.
    Failed(String),
}

impl TunnelStatus {
    /// The set constrained by the single-active-tunnel policy: at most one
    /// tunnel may be in an up state system-wide.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Active | TunnelStatus::Activating | TunnelStatus::Reasserting
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Activating
                | TunnelStatus::Deactivating
                | TunnelStatus::Restarting
                | TunnelStatus::Reasserting
        )
    }

    /// Whether the entry may be removed from the collection without a prior
    /// deactivation.
    pub fn can_remove(&self) -> bool {
        matches!(self, TunnelStatus::Inactive | TunnelStatus::Failed(_))
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Inactive => write!(f, "inactive"),
            TunnelStatus::Activating => write!(f, "activating"),
            TunnelStatus::Active => write!(f, "active"),
            TunnelStatus::Deactivating => write!(f, "deactivating"),
            TunnelStatus::Restarting => write!(f, "restarting"),
            TunnelStatus::Reasserting => write!(f, "reasserting"),
            TunnelStatus::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Opaque configuration payload of a tunnel.
///
/// Value type: edits replace it wholesale, it is never partially mutated.
/// Whole-value equality is what duplicate detection is based on. Address and
/// route strings are kept verbatim; materialising them into an actual network
/// configuration is the system VPN service's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub private_key: String,
    pub addresses: Vec<String>,
    pub peer_public_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

impl TunnelConfig {
    /// Checks that all required fields are present.
    ///
    /// Returns the human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.private_key.is_empty() {
            return Err("interface private key is missing".to_owned());
        }

        if self.peer_public_key.is_empty() {
            return Err("peer public key is missing".to_owned());
        }

        if self.addresses.is_empty() {
            return Err("interface has no addresses".to_owned());
        }

        Ok(())
    }
}

/// One configured tunnel plus its last-known runtime status.
///
/// The status is runtime-only: persisted collections always reload as
/// [`TunnelStatus::Inactive`] and are reconciled against the live system
/// service on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    pub config: TunnelConfig,
    #[serde(skip)]
    pub status: TunnelStatus,
}

impl Tunnel {
    pub fn new(name: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            id: TunnelId::random(),
            name: name.into(),
            config,
            status: TunnelStatus::Inactive,
        }
    }
}
