//! The single serialization point for the tunnel collection.
//!
//! One task owns the store, the driver and the notifier, and everything that
//! touches them flows through this loop: user commands, status updates from
//! the system service and the driver's own task completions. A status update
//! and a user-initiated mutation can therefore never race, and at most one
//! store mutation is ever in progress.
//!
//! For every mutation the order is fixed: store commit, snapshot publish,
//! observer notification, caller reply. An observer reacting synchronously to
//! an event thus sees a collection that already reflects it.

use crate::Error;
use crate::driver::{ActivationDriver, DriverEvent, StatusUpdate, Transition};
use crate::notifier::{ChangeNotifier, ObserverId, TunnelObserver};
use crate::store::TunnelStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tunnel_model::{Tunnel, TunnelConfig, TunnelId, TunnelStatus};

pub(crate) enum Command {
    Add {
        name: String,
        config: TunnelConfig,
        reply: oneshot::Sender<Result<TunnelId, Error>>,
    },
    Remove {
        id: TunnelId,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Rename {
        id: TunnelId,
        new_name: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    UpdateConfig {
        id: TunnelId,
        config: TunnelConfig,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Move {
        from: usize,
        to: usize,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    StartActivation(TunnelId),
    StartDeactivation(TunnelId),
    Attach {
        observer: Arc<dyn TunnelObserver>,
        reply: oneshot::Sender<ObserverId>,
    },
    Detach(ObserverId),
}

pub(crate) struct Eventloop {
    store: TunnelStore,
    driver: ActivationDriver,
    notifier: ChangeNotifier,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_rx: mpsc::Receiver<StatusUpdate>,
    driver_rx: mpsc::Receiver<DriverEvent>,
    snapshot_tx: watch::Sender<Vec<Tunnel>>,

    /// Removals waiting for a teardown to complete before they can apply.
    pending_removals: HashMap<TunnelId, oneshot::Sender<Result<(), Error>>>,

    status_channel_closed: bool,
}

impl Eventloop {
    pub fn new(
        store: TunnelStore,
        driver: ActivationDriver,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        status_rx: mpsc::Receiver<StatusUpdate>,
        driver_rx: mpsc::Receiver<DriverEvent>,
        snapshot_tx: watch::Sender<Vec<Tunnel>>,
    ) -> Self {
        Self {
            store,
            driver,
            notifier: ChangeNotifier::default(),
            cmd_rx,
            status_rx,
            driver_rx,
            snapshot_tx,
            pending_removals: HashMap::new(),
            status_channel_closed: false,
        }
    }

    pub async fn run(mut self) {
        std::future::poll_fn(|cx| self.poll(cx)).await;

        tracing::debug!("All `TunnelManager` handles dropped, exiting eventloop");
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.cmd_rx.poll_recv(cx) {
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Ready(Some(cmd)) => {
                    self.handle_command(cmd);
                    continue;
                }
                Poll::Pending => {}
            }

            if !self.status_channel_closed {
                match self.status_rx.poll_recv(cx) {
                    Poll::Ready(Some(update)) => {
                        let transitions = self.driver.handle_status(update);
                        self.apply_transitions(transitions);
                        continue;
                    }
                    Poll::Ready(None) => {
                        tracing::warn!("System service status channel closed");
                        self.status_channel_closed = true;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            match self.driver_rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    self.handle_driver_event(event);
                    continue;
                }
                // We hold a sender through the driver, so this can't happen.
                Poll::Ready(None) => {}
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add {
                name,
                config,
                reply,
            } => {
                let result = self.store.add(&name, config);

                if let Ok((_, index)) = &result {
                    self.publish();
                    self.notifier.added(*index);
                }

                let _ = reply.send(result.map(|(id, _)| id));
            }
            Command::Remove { id, reply } => self.handle_remove(id, reply),
            Command::Rename {
                id,
                new_name,
                reply,
            } => {
                let result = self.store.rename(id, &new_name);

                if let Ok(index) = &result {
                    self.publish();
                    self.notifier.modified(*index);
                }

                let _ = reply.send(result.map(|_| ()));
            }
            Command::UpdateConfig { id, config, reply } => {
                let result = self.store.update_config(id, config);

                if let Ok(index) = &result {
                    self.publish();
                    self.notifier.modified(*index);
                }

                let _ = reply.send(result.map(|_| ()));
            }
            Command::Move { from, to, reply } => {
                let result = self.store.move_entry(from, to);

                if let Ok((from, to)) = &result {
                    self.publish();
                    self.notifier.moved(*from, *to);
                }

                let _ = reply.send(result.map(|_| ()));
            }
            Command::StartActivation(id) => self.start_activation(id),
            Command::StartDeactivation(id) => self.start_deactivation(id),
            Command::Attach { observer, reply } => {
                let id = self.notifier.attach(observer, self.store.len());
                let _ = reply.send(id);
            }
            Command::Detach(id) => self.notifier.detach(id),
        }
    }

    fn handle_remove(&mut self, id: TunnelId, reply: oneshot::Sender<Result<(), Error>>) {
        let Some(tunnel) = self.store.by_id(id) else {
            let _ = reply.send(Err(Error::UnknownTunnel(id)));
            return;
        };

        if tunnel.status.can_remove() {
            let _ = reply.send(self.remove_now(id).map(|_| ()));
            return;
        }

        if self.pending_removals.contains_key(&id) {
            let _ = reply.send(Err(Error::RequestInProgress));
            return;
        }

        // The entry is up: tear it down first and finish the removal once the
        // teardown's completion signal arrives. Never silently skipped; if
        // the teardown fails, the removal is aborted and the failure
        // surfaces through `reply`.
        let status = tunnel.status.clone();

        match self.driver.deactivate(id, &status) {
            Ok(transitions) => {
                self.pending_removals.insert(id, reply);
                self.apply_transitions(transitions);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn remove_now(&mut self, id: TunnelId) -> Result<usize, Error> {
        let (_, index) = self.store.remove(id)?;

        self.publish();
        self.notifier.removed(index);

        Ok(index)
    }

    fn start_activation(&mut self, id: TunnelId) {
        let Some(tunnel) = self.store.by_id(id) else {
            tracing::warn!(%id, "Cannot activate unknown tunnel");
            return;
        };

        let config = tunnel.config.clone();
        let current = self
            .store
            .active_entry()
            .map(|t| (t.id, t.status.clone()));

        match self.driver.activate(id, config, current) {
            Ok(transitions) => self.apply_transitions(transitions),
            Err(Error::RequestInProgress) => {
                tracing::debug!(%id, "Activation request already in flight");
            }
            Err(e) => {
                // Synchronous driver rejections surface as the entry's
                // status, like any other activation failure: the caller of
                // `start_activation` is long gone.
                let transitions = self.driver.fail(id, e.to_string());
                self.apply_transitions(transitions);
            }
        }
    }

    fn start_deactivation(&mut self, id: TunnelId) {
        let Some(tunnel) = self.store.by_id(id) else {
            tracing::warn!(%id, "Cannot deactivate unknown tunnel");
            return;
        };

        let status = tunnel.status.clone();

        match self.driver.deactivate(id, &status) {
            Ok(transitions) => self.apply_transitions(transitions),
            Err(Error::RequestInProgress) => {
                tracing::debug!(%id, "Deactivation request already in flight");
            }
            Err(e) => tracing::warn!(%id, "Failed to start deactivation: {e}"),
        }
    }

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::RequestFailed { id, kind, reason } => {
                tracing::warn!(%id, ?kind, "VPN service request failed: {reason}");

                let transitions = self.driver.handle_request_failure(id, kind, reason);
                self.apply_transitions(transitions);
            }
            DriverEvent::FailureGraceExpired { id } => {
                let still_failed = self
                    .store
                    .by_id(id)
                    .is_some_and(|t| matches!(t.status, TunnelStatus::Failed(_)));

                if still_failed {
                    self.apply_transitions(vec![(id, TunnelStatus::Inactive)]);
                }
            }
        }
    }

    /// Applies status transitions to the store, in order, emitting one
    /// "modified" notification per actual change.
    fn apply_transitions(&mut self, transitions: Vec<Transition>) {
        for (id, status) in transitions {
            let became_inactive = matches!(status, TunnelStatus::Inactive);
            let failure_reason = match &status {
                TunnelStatus::Failed(reason) => Some(reason.clone()),
                _ => None,
            };

            let Some(index) = self.store.set_status(id, status) else {
                // Unknown (e.g. removed meanwhile) or unchanged.
                continue;
            };

            self.publish();
            self.notifier.modified(index);

            if became_inactive {
                // A removal may have been waiting for this teardown.
                if let Some(reply) = self.pending_removals.remove(&id) {
                    let _ = reply.send(self.remove_now(id).map(|_| ()));
                }
            } else if let Some(reason) = failure_reason {
                if let Some(reply) = self.pending_removals.remove(&id) {
                    let _ = reply.send(Err(Error::DriverFailure(reason)));
                }
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.store.snapshot());
    }
}
