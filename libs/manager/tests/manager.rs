#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tunnel_manager::{
    Error, JsonDecoder, ManagerConfig, ServiceError, ServiceStatus, StatusUpdate, Tunnel,
    TunnelConfig, TunnelId, TunnelManager, TunnelObserver, TunnelStatus, VpnService,
};
use tunnel_manager::{InMemoryStorage, NamePolicy};

#[tokio::test]
async fn added_tunnel_shows_up_in_the_list() {
    let (manager, _service) = manager().await;

    let id = manager.add_tunnel("home", config("a")).await.unwrap();

    let tunnels = manager.list_tunnels();

    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].id, id);
    assert_eq!(tunnels[0].name, "home");
    assert_eq!(tunnels[0].config, config("a"));
    assert_eq!(tunnels[0].status, TunnelStatus::Inactive);
}

#[tokio::test]
async fn colliding_name_is_disambiguated_but_identical_config_is_rejected() {
    let (manager, _service) = manager().await;

    manager.add_tunnel("home", config("a")).await.unwrap();
    manager.add_tunnel("home", config("b")).await.unwrap();

    let names = manager
        .list_tunnels()
        .into_iter()
        .map(|t| t.name)
        .collect::<Vec<_>>();

    assert_eq!(names, vec!["home", "home (1)"]);

    assert!(matches!(
        manager.add_tunnel("elsewhere", config("a")).await,
        Err(Error::DuplicateConfiguration)
    ));
}

#[tokio::test]
async fn notification_balance_matches_the_list_length() {
    let (manager, _service) = manager().await;

    let observer = Arc::new(Counting::default());
    let _handle = manager.observe(observer.clone()).await.unwrap();

    manager.add_tunnel("a", config("a")).await.unwrap();
    let b = manager.add_tunnel("b", config("b")).await.unwrap();
    manager.add_tunnel("c", config("c")).await.unwrap();
    manager.remove_tunnel(b).await.unwrap();

    let added = observer.added.load(Ordering::SeqCst);
    let removed = observer.removed.load(Ordering::SeqCst);

    assert_eq!(added, 3);
    assert_eq!(removed, 1);
    assert_eq!(added - removed, manager.list_tunnels().len());
}

#[tokio::test]
async fn activation_walks_through_the_state_machine() {
    let (manager, _service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();
    manager.start_activation(id);

    wait_for(&mut snapshots, |t| {
        status_of(t, id) == TunnelStatus::Active
    })
    .await;
}

#[tokio::test]
async fn activating_a_second_tunnel_takes_the_first_down_before_the_second_comes_up() {
    let (manager, _service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let a = manager.add_tunnel("a", config("a")).await.unwrap();
    let b = manager.add_tunnel("b", config("b")).await.unwrap();

    manager.start_activation(a);
    wait_for(&mut snapshots, |t| status_of(t, a) == TunnelStatus::Active).await;

    let recorder = Arc::new(Recorder {
        rx: manager.watch_tunnels(),
        snapshots: Mutex::new(Vec::new()),
    });
    let _handle = manager.observe(recorder.clone()).await.unwrap();

    manager.start_activation(b);
    wait_for(&mut snapshots, |t| status_of(t, b) == TunnelStatus::Active).await;

    let recorded = recorder.snapshots.lock().clone();

    // Never more than one tunnel up, at any observation point.
    for snapshot in &recorded {
        assert!(snapshot.iter().filter(|t| t.status.is_up()).count() <= 1);
    }

    assert_eq!(
        distinct_statuses(&recorded, a),
        vec![
            TunnelStatus::Deactivating,
            TunnelStatus::Inactive,
        ]
    );
    assert_eq!(
        distinct_statuses(&recorded, b),
        vec![
            TunnelStatus::Inactive,
            TunnelStatus::Activating,
            TunnelStatus::Active,
        ]
    );

    // The first snapshot showing b up already shows a fully down.
    let first_b_up = recorded
        .iter()
        .find(|s| status_of(s, b).is_up())
        .expect("b came up");

    assert_eq!(status_of(first_b_up, a), TunnelStatus::Inactive);
}

#[tokio::test]
async fn switchover_requested_while_the_first_tunnel_is_still_activating() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let a = manager.add_tunnel("a", config("a")).await.unwrap();
    let b = manager.add_tunnel("b", config("b")).await.unwrap();

    service.state.lock().manual = true;

    let recorder = Arc::new(Recorder {
        rx: manager.watch_tunnels(),
        snapshots: Mutex::new(Vec::new()),
    });
    let _handle = manager.observe(recorder.clone()).await.unwrap();

    manager.start_activation(a);
    wait_for(&mut snapshots, |t| {
        status_of(t, a) == TunnelStatus::Activating
    })
    .await;

    // Switch to b before a has finished coming up.
    manager.start_activation(b);

    // The moment a's activation completes, it is torn right back down.
    service.post(a, ServiceStatus::Connected).await;
    wait_for(&mut snapshots, |t| {
        status_of(t, a) == TunnelStatus::Deactivating
    })
    .await;

    service.post(a, ServiceStatus::Disconnecting).await;
    service.post(a, ServiceStatus::Disconnected).await;
    wait_for(&mut snapshots, |t| {
        status_of(t, b) == TunnelStatus::Activating
    })
    .await;

    service.post(b, ServiceStatus::Connecting).await;
    service.post(b, ServiceStatus::Connected).await;
    wait_for(&mut snapshots, |t| status_of(t, b) == TunnelStatus::Active).await;

    let recorded = recorder.snapshots.lock().clone();

    // Never more than one tunnel up, at any observation point.
    for snapshot in &recorded {
        assert!(snapshot.iter().filter(|t| t.status.is_up()).count() <= 1);
    }

    // The first snapshot showing b up already shows a fully down.
    let first_b_up = recorded
        .iter()
        .find(|s| status_of(s, b).is_up())
        .expect("b came up");

    assert_eq!(status_of(first_b_up, a), TunnelStatus::Inactive);
}

#[tokio::test]
async fn reactivating_during_teardown_shows_restarting_and_comes_back_up() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();

    manager.start_activation(id);
    wait_for(&mut snapshots, |t| status_of(t, id) == TunnelStatus::Active).await;

    service.state.lock().manual = true;

    manager.start_deactivation(id);
    wait_for(&mut snapshots, |t| {
        status_of(t, id) == TunnelStatus::Deactivating
    })
    .await;

    manager.start_activation(id);
    wait_for(&mut snapshots, |t| {
        status_of(t, id) == TunnelStatus::Restarting
    })
    .await;

    // Teardown progress does not clobber the restart indication. The sleep
    // yields to the eventloop so the update is guaranteed to be processed.
    service.post(id, ServiceStatus::Disconnecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        status_of(&manager.list_tunnels(), id),
        TunnelStatus::Restarting
    );

    service.post(id, ServiceStatus::Disconnected).await;
    service.post(id, ServiceStatus::Connecting).await;
    service.post(id, ServiceStatus::Connected).await;
    wait_for(&mut snapshots, |t| status_of(t, id) == TunnelStatus::Active).await;
}

#[tokio::test]
async fn deactivating_an_inactive_tunnel_produces_no_event() {
    let (manager, _service) = manager().await;

    let id = manager.add_tunnel("home", config("a")).await.unwrap();

    let observer = Arc::new(Counting::default());
    let _handle = manager.observe(observer.clone()).await.unwrap();

    manager.start_deactivation(id);

    // A command round-trip flushes everything queued before it.
    manager.rename_tunnel(id, "still home").await.unwrap();

    assert_eq!(observer.modified.load(Ordering::SeqCst), 1); // The rename only.
}

#[tokio::test]
async fn removing_an_active_tunnel_deactivates_it_first() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();

    manager.start_activation(id);
    wait_for(&mut snapshots, |t| status_of(t, id) == TunnelStatus::Active).await;

    manager.remove_tunnel(id).await.unwrap();

    assert_eq!(manager.list_tunnels().len(), 0);
    assert_eq!(service.state.lock().active, None);
}

#[tokio::test]
async fn a_failing_teardown_aborts_the_removal() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();

    manager.start_activation(id);
    wait_for(&mut snapshots, |t| status_of(t, id) == TunnelStatus::Active).await;

    service.state.lock().fail_deactivate = Some(id);

    let result = manager.remove_tunnel(id).await;

    assert!(matches!(result, Err(Error::DriverFailure(_))));
    assert_eq!(manager.list_tunnels().len(), 1);
}

#[tokio::test]
async fn failed_activation_reports_the_reason_then_resets() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();
    service.state.lock().fail_activate = Some(id);

    manager.start_activation(id);

    wait_for(&mut snapshots, |t| {
        matches!(status_of(t, id), TunnelStatus::Failed(reason) if reason.contains("handshake"))
    })
    .await;

    // The failure is transient: back to inactive after the grace period.
    wait_for(&mut snapshots, |t| {
        status_of(t, id) == TunnelStatus::Inactive
    })
    .await;
}

#[tokio::test]
async fn missing_authorization_surfaces_as_a_failed_status() {
    let (manager, service) = manager().await;
    let mut snapshots = manager.watch_tunnels();

    let id = manager.add_tunnel("home", config("a")).await.unwrap();
    service.state.lock().unauthorized = true;

    manager.start_activation(id);

    wait_for(&mut snapshots, |t| {
        matches!(status_of(t, id), TunnelStatus::Failed(reason) if reason.contains("authorized"))
    })
    .await;
}

#[tokio::test]
async fn startup_reconciles_against_the_running_tunnel() {
    let home = Tunnel::new("home", config("a"));
    let work = Tunnel::new("work", config("b"));
    let (home_id, work_id) = (home.id, work.id);

    let storage = InMemoryStorage::seeded(vec![home, work]);
    let service = Arc::new(ScriptedService::default());
    service.state.lock().active = Some(work_id);

    let manager = TunnelManager::spawn(
        Box::new(storage),
        service,
        test_config(),
        tokio::runtime::Handle::current(),
    )
    .await
    .unwrap();

    let tunnels = manager.list_tunnels();

    assert_eq!(status_of(&tunnels, home_id), TunnelStatus::Inactive);
    assert_eq!(status_of(&tunnels, work_id), TunnelStatus::Active);
}

#[tokio::test]
async fn import_aggregates_per_entry_failures() {
    let (manager, _service) = manager().await;

    let payload = serde_json::json!([
        { "name": "good", "config": config("a") },
        { "name": "bad", "config": { "private_key": "", "addresses": [], "peer_public_key": "" } },
    ]);

    let outcome = manager
        .import_tunnels(&JsonDecoder, &serde_json::to_vec(&payload).unwrap())
        .await
        .unwrap();

    assert_eq!(outcome.added.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "bad");
    assert!(matches!(
        outcome.failed[0].1,
        Error::InvalidConfiguration(_)
    ));
    assert_eq!(manager.list_tunnels().len(), 1);

    assert!(matches!(
        manager.import_tunnels(&JsonDecoder, b"garbage").await,
        Err(Error::Import(_))
    ));
}

#[tokio::test]
async fn failed_persistence_rolls_back_and_surfaces() {
    let storage = InMemoryStorage::new();
    let service = Arc::new(ScriptedService::default());

    let manager = TunnelManager::spawn(
        Box::new(storage.clone()),
        service,
        test_config(),
        tokio::runtime::Handle::current(),
    )
    .await
    .unwrap();

    manager.add_tunnel("home", config("a")).await.unwrap();

    storage.fail_next_save();

    assert!(matches!(
        manager.add_tunnel("work", config("b")).await,
        Err(Error::Persistence(_))
    ));
    assert_eq!(manager.list_tunnels().len(), 1);
    assert_eq!(storage.contents().len(), 1);

    // Subsequent mutations go through again.
    manager.add_tunnel("work", config("b")).await.unwrap();

    assert_eq!(manager.list_tunnels().len(), 2);
}

#[tokio::test]
async fn attaching_an_observer_delivers_the_current_count() {
    let (manager, _service) = manager().await;

    manager.add_tunnel("a", config("a")).await.unwrap();
    manager.add_tunnel("b", config("b")).await.unwrap();

    let observer = Arc::new(Counting::default());
    let handle = manager.observe(observer.clone()).await.unwrap();

    assert_eq!(*observer.attached.lock(), Some(2));

    // Detached on drop: later events no longer arrive.
    drop(handle);

    manager.add_tunnel("c", config("c")).await.unwrap();

    assert_eq!(observer.added.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn moving_an_entry_notifies_both_indices() {
    let (manager, _service) = manager().await;

    manager.add_tunnel("a", config("a")).await.unwrap();
    manager.add_tunnel("b", config("b")).await.unwrap();
    manager.add_tunnel("c", config("c")).await.unwrap();

    let observer = Arc::new(Counting::default());
    let _handle = manager.observe(observer.clone()).await.unwrap();

    manager.move_tunnel(2, 0).await.unwrap();

    assert_eq!(*observer.moved.lock(), vec![(2, 0)]);

    let names = manager
        .list_tunnels()
        .into_iter()
        .map(|t| t.name)
        .collect::<Vec<_>>();

    assert_eq!(names, vec!["c", "a", "b"]);

    assert!(matches!(
        manager.move_tunnel(5, 0).await,
        Err(Error::InvalidIndex)
    ));
}

async fn manager() -> (TunnelManager, Arc<ScriptedService>) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();

    let service = Arc::new(ScriptedService::default());

    let manager = TunnelManager::spawn(
        Box::new(InMemoryStorage::new()),
        service.clone(),
        test_config(),
        tokio::runtime::Handle::current(),
    )
    .await
    .unwrap();

    (manager, service)
}

fn test_config() -> ManagerConfig {
    ManagerConfig {
        name_policy: NamePolicy::NumberedSuffix,
        failure_grace_period: Duration::from_millis(100),
    }
}

fn config(seed: &str) -> TunnelConfig {
    TunnelConfig {
        private_key: format!("private-{seed}"),
        addresses: vec!["10.0.0.2/32".to_owned()],
        peer_public_key: format!("peer-{seed}"),
        endpoint: Some("demo.wireguard.com:51820".to_owned()),
        allowed_ips: vec!["0.0.0.0/0".to_owned()],
        dns: vec![],
    }
}

async fn wait_for(rx: &mut watch::Receiver<Vec<Tunnel>>, predicate: impl Fn(&[Tunnel]) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|t| predicate(t)))
        .await
        .expect("timed out waiting for the expected state")
        .expect("manager exited");
}

fn status_of(tunnels: &[Tunnel], id: TunnelId) -> TunnelStatus {
    tunnels
        .iter()
        .find(|t| t.id == id)
        .map(|t| t.status.clone())
        .expect("tunnel is listed")
}

/// Per-tunnel status sequence across recorded snapshots, consecutive
/// duplicates collapsed.
fn distinct_statuses(snapshots: &[Vec<Tunnel>], id: TunnelId) -> Vec<TunnelStatus> {
    let mut out = Vec::<TunnelStatus>::new();

    for snapshot in snapshots {
        let status = status_of(snapshot, id);

        if out.last() != Some(&status) {
            out.push(status);
        }
    }

    out
}

/// A system VPN service scripted from the test body.
///
/// Requests complete immediately and post the corresponding status
/// transitions in order, which keeps tests deterministic while still going
/// through the real asynchronous machinery.
#[derive(Default)]
struct ScriptedService {
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    status_tx: Option<mpsc::Sender<StatusUpdate>>,
    active: Option<TunnelId>,
    unauthorized: bool,
    fail_activate: Option<TunnelId>,
    fail_deactivate: Option<TunnelId>,
    /// When set, requests complete without posting any status updates; the
    /// test body posts them itself to exercise specific interleavings.
    manual: bool,
}

impl ScriptedService {
    async fn post(&self, id: TunnelId, status: ServiceStatus) {
        let tx = self.state.lock().status_tx.clone();

        if let Some(tx) = tx {
            let _ = tx.send(StatusUpdate { id, status }).await;
        }
    }
}

#[async_trait]
impl VpnService for ScriptedService {
    fn is_authorized(&self) -> bool {
        !self.state.lock().unauthorized
    }

    async fn set_active(&self, id: TunnelId, _: &TunnelConfig) -> Result<(), ServiceError> {
        let manual = {
            let state = self.state.lock();

            if state.fail_activate == Some(id) {
                return Err(ServiceError::Other("handshake timed out".to_owned()));
            }

            state.manual
        };

        if !manual {
            self.post(id, ServiceStatus::Connecting).await;
            self.post(id, ServiceStatus::Connected).await;
        }

        self.state.lock().active = Some(id);

        Ok(())
    }

    async fn set_inactive(&self, id: TunnelId) -> Result<(), ServiceError> {
        let manual = {
            let state = self.state.lock();

            if state.fail_deactivate == Some(id) {
                return Err(ServiceError::Other("tunnel provider is unreachable".to_owned()));
            }

            state.manual
        };

        if !manual {
            self.post(id, ServiceStatus::Disconnecting).await;
            self.post(id, ServiceStatus::Disconnected).await;
        }

        let mut state = self.state.lock();

        if state.active == Some(id) {
            state.active = None;
        }

        Ok(())
    }

    async fn active_tunnel(&self) -> Option<TunnelId> {
        self.state.lock().active
    }

    fn subscribe(&self) -> mpsc::Receiver<StatusUpdate> {
        let (tx, rx) = mpsc::channel(256);
        self.state.lock().status_tx = Some(tx);

        rx
    }
}

#[derive(Default)]
struct Counting {
    added: AtomicUsize,
    modified: AtomicUsize,
    removed: AtomicUsize,
    moved: Mutex<Vec<(usize, usize)>>,
    attached: Mutex<Option<usize>>,
}

impl TunnelObserver for Counting {
    fn on_attach(&self, count: usize) {
        *self.attached.lock() = Some(count);
    }

    fn on_added(&self, _: usize) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn on_modified(&self, _: usize) {
        self.modified.fetch_add(1, Ordering::SeqCst);
    }

    fn on_moved(&self, from: usize, to: usize) {
        self.moved.lock().push((from, to));
    }

    fn on_removed(&self, _: usize) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records a full collection snapshot at every "modified" event, for
/// asserting transition ordering.
struct Recorder {
    rx: watch::Receiver<Vec<Tunnel>>,
    snapshots: Mutex<Vec<Vec<Tunnel>>>,
}

impl TunnelObserver for Recorder {
    fn on_modified(&self, _: usize) {
        self.snapshots.lock().push(self.rx.borrow().clone());
    }
}
