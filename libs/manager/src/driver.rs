//! Bridge between the tunnel collection and the system VPN service.
//!
//! The driver issues activate/deactivate requests and enforces two rules the
//! service itself doesn't know about: at most one in-flight request per
//! tunnel, and at most one tunnel up system-wide. It holds only per-id
//! request markers; the store remains the single authority on status.

use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tunnel_model::{TunnelConfig, TunnelId, TunnelStatus};

/// Connection state as reported by the system service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reasserting,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub id: TunnelId,
    pub status: ServiceStatus,
}

/// Failure reported by the system service when a request is rejected or a
/// negotiation fails.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("not authorized to control the VPN service")]
    NoPermission,
    #[error("configuration rejected: {0}")]
    InvalidConfiguration(String),
    #[error("{0}")]
    Other(String),
}

/// Asynchronous contract of the underlying system VPN service.
///
/// `set_active` and `set_inactive` complete when the *request* has been
/// handed over; the actual state transitions arrive through the channel
/// returned by `subscribe`, in arrival order per tunnel id. Updates for
/// different ids may interleave. The service also posts transitions it was
/// never asked for, e.g. when a tunnel is torn down by an external cause.
#[async_trait]
pub trait VpnService: Send + Sync + 'static {
    fn is_authorized(&self) -> bool;

    async fn set_active(&self, id: TunnelId, config: &TunnelConfig) -> Result<(), ServiceError>;

    async fn set_inactive(&self, id: TunnelId) -> Result<(), ServiceError>;

    /// The tunnel currently running under this service, if any.
    ///
    /// Queried once at startup to reconcile the freshly loaded collection.
    async fn active_tunnel(&self) -> Option<TunnelId>;

    fn subscribe(&self) -> mpsc::Receiver<StatusUpdate>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Activate,
    Deactivate,
}

/// Events the driver feeds back into the eventloop from its spawned tasks.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    RequestFailed {
        id: TunnelId,
        kind: RequestKind,
        reason: String,
    },
    FailureGraceExpired {
        id: TunnelId,
    },
}

/// Status changes the store must apply, in order.
pub(crate) type Transition = (TunnelId, TunnelStatus);

/// An activation parked behind the teardown of another (or the same) tunnel.
struct QueuedActivation {
    id: TunnelId,
    config: TunnelConfig,
    behind: TunnelId,
}

pub(crate) struct ActivationDriver {
    service: Arc<dyn VpnService>,
    event_tx: mpsc::Sender<DriverEvent>,
    in_flight: HashMap<TunnelId, RequestKind>,
    queued_activation: Option<QueuedActivation>,
    /// A teardown requested while the same tunnel's activation is still in
    /// flight; issued once the activation completes.
    queued_deactivation: Option<TunnelId>,
    failure_grace_period: Duration,
}

impl ActivationDriver {
    pub fn new(
        service: Arc<dyn VpnService>,
        event_tx: mpsc::Sender<DriverEvent>,
        failure_grace_period: Duration,
    ) -> Self {
        Self {
            service,
            event_tx,
            in_flight: HashMap::new(),
            queued_activation: None,
            queued_deactivation: None,
            failure_grace_period,
        }
    }

    /// Requests activation of `id`.
    ///
    /// `current` is the entry currently counting against the single-active
    /// policy, if any. Returns the status transitions to apply now; the rest
    /// arrive later through the status channel. Never blocks on the service.
    pub fn activate(
        &mut self,
        id: TunnelId,
        config: TunnelConfig,
        current: Option<(TunnelId, TunnelStatus)>,
    ) -> Result<Vec<Transition>, Error> {
        if !self.service.is_authorized() {
            return Err(Error::NoPermission);
        }

        config.validate().map_err(Error::InvalidConfiguration)?;

        match self.in_flight.get(&id) {
            Some(RequestKind::Activate) => return Err(Error::RequestInProgress),
            Some(RequestKind::Deactivate) => {
                // Re-activation of a tunnel that is still tearing down: park
                // it behind the teardown's completion.
                self.park(QueuedActivation {
                    id,
                    config,
                    behind: id,
                });

                return Ok(vec![(id, TunnelStatus::Restarting)]);
            }
            None => {}
        }

        match current {
            Some((other, _)) if other == id => Ok(Vec::new()), // Already up.
            Some((other, _)) => {
                // Single-active policy: tear the current tunnel down first
                // and park this activation behind its completion.
                let mut transitions = Vec::new();

                match self.in_flight.get(&other) {
                    None => {
                        self.issue_deactivate(other);
                        transitions.push((other, TunnelStatus::Deactivating));
                    }
                    Some(RequestKind::Activate) => {
                        // The other tunnel hasn't even finished coming up;
                        // tear it down as soon as its activation completes.
                        self.queued_deactivation = Some(other);
                    }
                    Some(RequestKind::Deactivate) => {} // Already tearing down.
                }

                self.park(QueuedActivation {
                    id,
                    config,
                    behind: other,
                });

                Ok(transitions)
            }
            None => {
                if let Some(old) = self.queued_activation.take() {
                    tracing::debug!(superseded = %old.id, "Dropping parked activation; newest intent wins");
                }

                self.issue_activate(id, config);

                Ok(vec![(id, TunnelStatus::Activating)])
            }
        }
    }

    /// Requests deactivation of `id`.
    ///
    /// Idempotent: a tunnel that is already down completes as a no-op with no
    /// status event. A deactivation racing an in-flight activation of the
    /// same tunnel is queued behind that activation's completion, never
    /// issued concurrently with it.
    pub fn deactivate(
        &mut self,
        id: TunnelId,
        status: &TunnelStatus,
    ) -> Result<Vec<Transition>, Error> {
        // Cancel a parked activation of this tunnel; the newest intent wins.
        if self.queued_activation.as_ref().is_some_and(|q| q.id == id) {
            self.queued_activation = None;

            if matches!(status, TunnelStatus::Restarting) {
                // The teardown the restart was parked behind is still in
                // flight; it now simply completes as a plain deactivation.
                return Ok(vec![(id, TunnelStatus::Deactivating)]);
            }
        }

        match self.in_flight.get(&id) {
            Some(RequestKind::Activate) => {
                self.queued_deactivation = Some(id);

                return Ok(Vec::new());
            }
            Some(RequestKind::Deactivate) => return Err(Error::RequestInProgress),
            None => {}
        }

        if status.can_remove() {
            return Ok(Vec::new());
        }

        self.issue_deactivate(id);

        Ok(vec![(id, TunnelStatus::Deactivating)])
    }

    /// Applies a status update from the system service.
    ///
    /// Terminal states clear the in-flight marker and release whatever was
    /// parked behind the request's completion.
    pub fn handle_status(&mut self, update: StatusUpdate) -> Vec<Transition> {
        let StatusUpdate { id, status } = update;

        let mapped = match status {
            ServiceStatus::Disconnected => TunnelStatus::Inactive,
            ServiceStatus::Connecting => TunnelStatus::Activating,
            ServiceStatus::Connected => TunnelStatus::Active,
            // A restarting tunnel keeps showing "restarting" through the
            // teardown's progress updates.
            ServiceStatus::Disconnecting if self.restart_parked(id) => TunnelStatus::Restarting,
            ServiceStatus::Disconnecting => TunnelStatus::Deactivating,
            ServiceStatus::Reasserting => TunnelStatus::Reasserting,
        };
        let mut transitions = vec![(id, mapped)];

        match status {
            ServiceStatus::Connected => {
                self.in_flight.remove(&id);

                if self.queued_deactivation == Some(id) {
                    self.queued_deactivation = None;
                    self.issue_deactivate(id);
                    transitions.push((id, TunnelStatus::Deactivating));
                }
            }
            ServiceStatus::Disconnected => {
                self.in_flight.remove(&id);

                match self.queued_activation.take() {
                    Some(parked) if parked.behind == id => {
                        self.issue_activate(parked.id, parked.config);
                        transitions.push((parked.id, TunnelStatus::Activating));
                    }
                    other => self.queued_activation = other,
                }
            }
            ServiceStatus::Connecting
            | ServiceStatus::Disconnecting
            | ServiceStatus::Reasserting => {}
        }

        transitions
    }

    /// Handles a request the service rejected or failed to carry out.
    pub fn handle_request_failure(
        &mut self,
        id: TunnelId,
        kind: RequestKind,
        reason: String,
    ) -> Vec<Transition> {
        self.in_flight.remove(&id);

        let mut transitions = Vec::new();

        match kind {
            RequestKind::Activate => {
                if self.queued_deactivation == Some(id) {
                    self.queued_deactivation = None;
                }

                // A switchover parked behind this activation's completion
                // can go ahead right away: the tunnel never came up.
                match self.queued_activation.take() {
                    Some(parked) if parked.behind == id => {
                        self.issue_activate(parked.id, parked.config);
                        transitions.push((parked.id, TunnelStatus::Activating));
                    }
                    other => self.queued_activation = other,
                }
            }
            RequestKind::Deactivate => match self.queued_activation.take() {
                Some(parked) if parked.behind == id => {
                    tracing::warn!(parked = %parked.id, "Dropping parked activation; the teardown it was waiting for failed");
                }
                other => self.queued_activation = other,
            },
        }

        transitions.extend(self.fail(id, reason));

        transitions
    }

    /// Marks `id` as failed and schedules the reset back to inactive after
    /// the grace period. The reason stays visible until then.
    pub fn fail(&self, id: TunnelId, reason: String) -> Vec<Transition> {
        let event_tx = self.event_tx.clone();
        let grace = self.failure_grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = event_tx.send(DriverEvent::FailureGraceExpired { id }).await;
        });

        vec![(id, TunnelStatus::Failed(reason))]
    }

    /// Parks an activation behind a teardown's completion, superseding any
    /// previously parked one; the newest intent wins.
    fn park(&mut self, parked: QueuedActivation) {
        if let Some(old) = self.queued_activation.replace(parked) {
            tracing::debug!(superseded = %old.id, "Dropping parked activation; newest intent wins");
        }
    }

    // Whether a re-activation of `id` is parked behind its own teardown.
    fn restart_parked(&self, id: TunnelId) -> bool {
        self.queued_activation
            .as_ref()
            .is_some_and(|q| q.id == id && q.behind == id)
    }

    fn issue_activate(&mut self, id: TunnelId, config: TunnelConfig) {
        self.in_flight.insert(id, RequestKind::Activate);

        let service = Arc::clone(&self.service);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = service.set_active(id, &config).await {
                let _ = event_tx
                    .send(DriverEvent::RequestFailed {
                        id,
                        kind: RequestKind::Activate,
                        reason: e.to_string(),
                    })
                    .await;
            }
        });
    }

    fn issue_deactivate(&mut self, id: TunnelId) {
        self.in_flight.insert(id, RequestKind::Deactivate);

        let service = Arc::clone(&self.service);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = service.set_inactive(id).await {
                let _ = event_tx
                    .send(DriverEvent::RequestFailed {
                        id,
                        kind: RequestKind::Deactivate,
                        reason: e.to_string(),
                    })
                    .await;
            }
        });
    }
}
