//! The authoritative ordered collection of tunnel entries.
//!
//! All mutators persist the updated collection synchronously before
//! committing it to memory, so a persistence failure leaves the store at its
//! last successfully persisted state. Serialization of mutations against each
//! other is the eventloop's job; the store itself is single-threaded.

use crate::Error;
use crate::persistence::Storage;
use tunnel_model::{Tunnel, TunnelConfig, TunnelId, TunnelStatus};

/// Policy for resolving a name collision when adding a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    /// `"home"` collides => `"home (1)"`, `"home (2)"`, ...
    #[default]
    NumberedSuffix,
    /// Collisions are rejected with [`Error::DuplicateName`].
    Reject,
}

pub(crate) struct TunnelStore {
    tunnels: Vec<Tunnel>,
    storage: Box<dyn Storage>,
    name_policy: NamePolicy,
}

impl TunnelStore {
    pub fn load(storage: Box<dyn Storage>, name_policy: NamePolicy) -> Result<Self, Error> {
        let tunnels = storage.load().map_err(Error::Persistence)?;

        Ok(Self {
            tunnels,
            storage,
            name_policy,
        })
    }

    /// Appends a new entry at the end of the list.
    ///
    /// A colliding name is disambiguated per the configured [`NamePolicy`]; a
    /// configuration identical to an existing entry is rejected outright.
    pub fn add(&mut self, name: &str, config: TunnelConfig) -> Result<(TunnelId, usize), Error> {
        if name.is_empty() {
            return Err(Error::InvalidName);
        }

        config.validate().map_err(Error::InvalidConfiguration)?;

        if self.tunnels.iter().any(|t| t.config == config) {
            return Err(Error::DuplicateConfiguration);
        }

        let name = self.unique_name(name)?;
        let tunnel = Tunnel::new(name, config);
        let id = tunnel.id;

        let mut candidate = self.tunnels.clone();
        candidate.push(tunnel);
        self.commit(candidate)?;

        Ok((id, self.tunnels.len() - 1))
    }

    /// Removes the entry and returns it along with the index it occupied.
    ///
    /// The store never deactivates on its own: removing an entry that is not
    /// inactive or failed is refused. Forcing a deactivation first is the
    /// controller's job.
    pub fn remove(&mut self, id: TunnelId) -> Result<(Tunnel, usize), Error> {
        let index = self.index_of(id).ok_or(Error::UnknownTunnel(id))?;

        if !self.tunnels[index].status.can_remove() {
            return Err(Error::TunnelActive);
        }

        let mut candidate = self.tunnels.clone();
        let tunnel = candidate.remove(index);
        self.commit(candidate)?;

        Ok((tunnel, index))
    }

    pub fn rename(&mut self, id: TunnelId, new_name: &str) -> Result<usize, Error> {
        let index = self.index_of(id).ok_or(Error::UnknownTunnel(id))?;

        if new_name.is_empty() {
            return Err(Error::InvalidName);
        }

        if self
            .tunnels
            .iter()
            .any(|t| t.id != id && t.name == new_name)
        {
            return Err(Error::DuplicateName(new_name.to_owned()));
        }

        let mut candidate = self.tunnels.clone();
        candidate[index].name = new_name.to_owned();
        self.commit(candidate)?;

        Ok(index)
    }

    /// Replaces the entry's configuration wholesale.
    pub fn update_config(&mut self, id: TunnelId, config: TunnelConfig) -> Result<usize, Error> {
        let index = self.index_of(id).ok_or(Error::UnknownTunnel(id))?;

        config.validate().map_err(Error::InvalidConfiguration)?;

        if self.tunnels.iter().any(|t| t.id != id && t.config == config) {
            return Err(Error::DuplicateConfiguration);
        }

        let mut candidate = self.tunnels.clone();
        candidate[index].config = config;
        self.commit(candidate)?;

        Ok(index)
    }

    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<(usize, usize), Error> {
        if from >= self.tunnels.len() || to >= self.tunnels.len() {
            return Err(Error::InvalidIndex);
        }

        let mut candidate = self.tunnels.clone();
        let tunnel = candidate.remove(from);
        candidate.insert(to, tunnel);
        self.commit(candidate)?;

        Ok((from, to))
    }

    /// Writes the entry's runtime status, returning its index for a
    /// "modified" notification.
    ///
    /// In-memory only: runtime status is never persisted. Returns `None` for
    /// unknown ids and for writes that don't change anything, so a no-op
    /// write never produces a notification.
    pub fn set_status(&mut self, id: TunnelId, status: TunnelStatus) -> Option<usize> {
        let index = self.index_of(id)?;

        if self.tunnels[index].status == status {
            return None;
        }

        self.tunnels[index].status = status;

        Some(index)
    }

    pub fn index_of(&self, id: TunnelId) -> Option<usize> {
        self.tunnels.iter().position(|t| t.id == id)
    }

    pub fn by_id(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.id == id)
    }

    /// The entry currently counting against the single-active-tunnel policy,
    /// if any.
    pub fn active_entry(&self) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.status.is_up())
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn snapshot(&self) -> Vec<Tunnel> {
        self.tunnels.clone()
    }

    fn unique_name(&self, requested: &str) -> Result<String, Error> {
        if !self.name_taken(requested) {
            return Ok(requested.to_owned());
        }

        match self.name_policy {
            NamePolicy::Reject => Err(Error::DuplicateName(requested.to_owned())),
            NamePolicy::NumberedSuffix => {
                let mut n = 1;

                loop {
                    let candidate = format!("{requested} ({n})");

                    if !self.name_taken(&candidate) {
                        return Ok(candidate);
                    }

                    n += 1;
                }
            }
        }
    }

    // Case-sensitive per the uniqueness policy.
    fn name_taken(&self, name: &str) -> bool {
        self.tunnels.iter().any(|t| t.name == name)
    }

    fn commit(&mut self, candidate: Vec<Tunnel>) -> Result<(), Error> {
        self.storage.save(&candidate).map_err(Error::Persistence)?;
        self.tunnels = candidate;

        Ok(())
    }
}
