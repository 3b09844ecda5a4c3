//! Tunnel lifecycle management and list synchronization.
//!
//! [`TunnelManager`] owns an ordered collection of tunnel entries, serializes
//! every mutation against it, drives each tunnel through its activation state
//! machine via the system VPN service and fans out granular change events
//! (added/modified/moved/removed) so any number of observing surfaces stay
//! consistent without re-reading the whole collection.
//!
//! A manager is created once at process start with [`TunnelManager::spawn`]
//! and passed by reference (it is cheap to clone) to every consumer; there is
//! no ambient global instance.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

mod driver;
mod error;
mod eventloop;
mod import;
mod notifier;
mod persistence;
mod store;

pub use driver::{ServiceError, ServiceStatus, StatusUpdate, VpnService};
pub use error::Error;
pub use import::{ConfigDecoder, ImportError, ImportOutcome, JsonDecoder};
pub use notifier::TunnelObserver;
pub use persistence::{InMemoryStorage, JsonFileStorage, Storage};
pub use store::NamePolicy;
pub use tunnel_model::{Tunnel, TunnelConfig, TunnelId, TunnelStatus};

use crate::driver::ActivationDriver;
use crate::eventloop::{Command, Eventloop};
use crate::notifier::ObserverId;
use crate::store::TunnelStore;

/// Tuning knobs for a [`TunnelManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub name_policy: NamePolicy,
    /// How long a failed tunnel keeps its failure reason visible before
    /// resetting to inactive.
    pub failure_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name_policy: NamePolicy::default(),
            failure_grace_period: Duration::from_secs(5),
        }
    }
}

/// Handle to the tunnel lifecycle subsystem.
///
/// Cheap to clone; all clones talk to the same eventloop. The eventloop exits
/// once every handle (and observer handle) is dropped.
#[derive(Clone)]
pub struct TunnelManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<Vec<Tunnel>>,
}

impl TunnelManager {
    /// Loads the persisted collection, reconciles it against the tunnel the
    /// system service reports as currently running and spawns the eventloop
    /// onto `handle`.
    ///
    /// Reconciliation happens before the manager is returned, so the first
    /// snapshot any observer sees never shows a running tunnel as inactive.
    pub async fn spawn(
        storage: Box<dyn Storage>,
        service: Arc<dyn VpnService>,
        config: ManagerConfig,
        handle: tokio::runtime::Handle,
    ) -> Result<Self, Error> {
        let mut store = TunnelStore::load(storage, config.name_policy)?;

        if let Some(running) = service.active_tunnel().await {
            if store.set_status(running, TunnelStatus::Active).is_none() {
                tracing::warn!(id = %running, "System service reports an unknown tunnel as running");
            }
        }

        let status_rx = service.subscribe();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (driver_tx, driver_rx) = mpsc::channel(128);
        let (snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());

        let driver = ActivationDriver::new(service, driver_tx, config.failure_grace_period);

        handle.spawn(Eventloop::new(store, driver, cmd_rx, status_rx, driver_rx, snapshot_tx).run());

        Ok(Self {
            cmd_tx,
            snapshot_rx,
        })
    }

    /// A snapshot of the ordered collection, safe to enumerate without any
    /// lock. Reflects the last completed mutation.
    pub fn list_tunnels(&self) -> Vec<Tunnel> {
        self.snapshot_rx.borrow().clone()
    }

    /// A watch channel yielding a new snapshot after every completed
    /// mutation, for consumers that only care about the latest state.
    pub fn watch_tunnels(&self) -> watch::Receiver<Vec<Tunnel>> {
        self.snapshot_rx.clone()
    }

    pub async fn add_tunnel(
        &self,
        name: impl Into<String>,
        config: TunnelConfig,
    ) -> Result<TunnelId, Error> {
        let name = name.into();

        self.request(|reply| Command::Add {
            name,
            config,
            reply,
        })
        .await
    }

    /// Decodes an external representation and adds one tunnel per decoded
    /// entry. A decode failure aborts the import; a failure of an individual
    /// add is recorded in the outcome and does not abort the batch.
    pub async fn import_tunnels(
        &self,
        decoder: &dyn ConfigDecoder,
        bytes: &[u8],
    ) -> Result<ImportOutcome, Error> {
        let entries = decoder.decode(bytes).map_err(Error::Import)?;

        let mut outcome = ImportOutcome::default();

        for (name, config) in entries {
            match self.add_tunnel(name.clone(), config).await {
                Ok(id) => outcome.added.push(id),
                Err(e) => outcome.failed.push((name, e)),
            }
        }

        Ok(outcome)
    }

    /// Removes a tunnel. An entry that is up is deactivated first; the
    /// removal applies once the teardown completes. If the teardown fails,
    /// the removal is aborted and the failure is returned.
    pub async fn remove_tunnel(&self, id: TunnelId) -> Result<(), Error> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    pub async fn rename_tunnel(
        &self,
        id: TunnelId,
        new_name: impl Into<String>,
    ) -> Result<(), Error> {
        let new_name = new_name.into();

        self.request(|reply| Command::Rename {
            id,
            new_name,
            reply,
        })
        .await
    }

    pub async fn update_tunnel(&self, id: TunnelId, config: TunnelConfig) -> Result<(), Error> {
        self.request(|reply| Command::UpdateConfig { id, config, reply })
            .await
    }

    pub async fn move_tunnel(&self, from: usize, to: usize) -> Result<(), Error> {
        self.request(|reply| Command::Move { from, to, reply })
            .await
    }

    /// Requests activation of `id` and returns immediately.
    ///
    /// Completion or failure is observed through status-change notifications,
    /// not a return value: activation is long-running and may go through
    /// reasserting cycles. If another tunnel is currently up it is
    /// deactivated first.
    pub fn start_activation(&self, id: TunnelId) {
        let _ = self.cmd_tx.send(Command::StartActivation(id));
    }

    /// Requests deactivation of `id` and returns immediately. Idempotent.
    pub fn start_deactivation(&self, id: TunnelId) {
        let _ = self.cmd_tx.send(Command::StartDeactivation(id));
    }

    /// Attaches an observer.
    ///
    /// The observer immediately receives the current tunnel count and from
    /// then on one callback per collection change, in registration order,
    /// until the returned handle is dropped.
    pub async fn observe(&self, observer: Arc<dyn TunnelObserver>) -> Result<ObserverHandle, Error> {
        let (reply, rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Attach { observer, reply })
            .map_err(|_| Error::ManagerShutDown)?;

        let id = rx.await.map_err(|_| Error::ManagerShutDown)?;

        Ok(ObserverHandle {
            id,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();

        self.cmd_tx
            .send(make(reply))
            .map_err(|_| Error::ManagerShutDown)?;

        rx.await.map_err(|_| Error::ManagerShutDown)?
    }
}

/// Scoped observer registration: detaches the observer when dropped.
pub struct ObserverHandle {
    id: ObserverId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Detach(self.id));
    }
}
