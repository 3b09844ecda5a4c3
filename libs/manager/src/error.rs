use crate::import::ImportError;
use tunnel_model::TunnelId;

/// Typed failures returned from manager operations.
///
/// Only synchronous validation failures live here. Asynchronous driver
/// failures are recorded as the entry's [`TunnelStatus::Failed`] status and
/// delivered through the same notification channel as successful transitions,
/// never thrown back at the caller of `start_activation`.
///
/// [`TunnelStatus::Failed`]: tunnel_model::TunnelStatus::Failed
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("an identical configuration already exists")]
    DuplicateConfiguration,
    #[error("a tunnel named `{0}` already exists")]
    DuplicateName(String),
    #[error("tunnel name must not be empty")]
    InvalidName,
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("tunnel is active; deactivate it before removing")]
    TunnelActive,
    #[error("not authorized to control the system VPN service")]
    NoPermission,
    #[error("a request for this tunnel is already in flight")]
    RequestInProgress,
    #[error("the system VPN service reported a failure: {0}")]
    DriverFailure(String),
    #[error("failed to persist tunnel collection")]
    Persistence(#[source] anyhow::Error),
    #[error("index is out of bounds")]
    InvalidIndex,
    #[error("no tunnel with id {0}")]
    UnknownTunnel(TunnelId),
    #[error("tunnel manager is shut down")]
    ManagerShutDown,
}
