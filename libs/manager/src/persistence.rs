//! Persistence collaborator for the tunnel collection.
//!
//! `save` runs synchronously at the end of every mutating store operation,
//! before the operation is considered complete. A failing save aborts the
//! mutation, so the backing representation and the in-memory view always
//! agree.

use anyhow::{Context as _, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use parking_lot::Mutex;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tunnel_model::Tunnel;

/// Backing storage for the ordered tunnel collection.
pub trait Storage: Send + 'static {
    /// Returns the full ordered collection, with all statuses reset to
    /// inactive.
    fn load(&self) -> Result<Vec<Tunnel>>;

    fn save(&self, tunnels: &[Tunnel]) -> Result<()>;
}

/// Stores the collection as a JSON document, written atomically.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Storage for JsonFileStorage {
    fn load(&self) -> Result<Vec<Tunnel>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read tunnel collection"),
        };

        serde_json::from_str(&content).context("Failed to deserialize tunnel collection")
    }

    fn save(&self, tunnels: &[Tunnel]) -> Result<()> {
        let content = serde_json::to_string_pretty(tunnels)
            .context("Failed to serialize tunnel collection")?;

        let file = AtomicFile::new(&self.path, OverwriteBehavior::AllowOverwrite);
        file.write(|f| f.write_all(content.as_bytes()))
            .context("Failed to write tunnel collection")?;

        Ok(())
    }
}

/// Keeps the collection in memory only.
///
/// Meant for tests and embedders without a durable representation. Clones
/// share the same underlying collection, so a test can inspect what the
/// manager persisted, seed it before startup, or arm a save failure.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tunnels: Mutex<Vec<Tunnel>>,
    fail_next_save: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(tunnels: Vec<Tunnel>) -> Self {
        let storage = Self::default();
        *storage.inner.tunnels.lock() = tunnels;

        storage
    }

    /// Makes the next `save` fail, for exercising mutation rollback.
    pub fn fail_next_save(&self) {
        self.inner.fail_next_save.store(true, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<Tunnel> {
        self.inner.tunnels.lock().clone()
    }
}

impl Storage for InMemoryStorage {
    fn load(&self) -> Result<Vec<Tunnel>> {
        Ok(self
            .inner
            .tunnels
            .lock()
            .iter()
            .cloned()
            .map(|mut t| {
                t.status = Default::default();
                t
            })
            .collect())
    }

    fn save(&self, tunnels: &[Tunnel]) -> Result<()> {
        if self.inner.fail_next_save.swap(false, Ordering::SeqCst) {
            anyhow::bail!("storage is unwritable");
        }

        *self.inner.tunnels.lock() = tunnels.to_vec();

        Ok(())
    }
}
