//! Condition store: named tri-state booleans gating service transitions.
//!
//! Every asserted key is mirrored to disk as an empty file whose path is the
//! key itself, rooted in the store directory; FLUX is distinguished from OFF
//! by a marker file in a parallel `flux/` subtree. The in-memory map is
//! authoritative; filesystem failures are logged and never fatal.

use std::{
    collections::HashMap,
    fs,
    path::{Component, Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::CondError;

/// Tri-state value of a condition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
pub enum CondState {
    /// Condition is asserted.
    On,
    /// Condition is not asserted; unknown keys read as OFF.
    Off,
    /// Condition was ON but its producer is being re-evaluated (reload).
    Flux,
}

/// One atom of a service condition expression.
///
/// Expressions are AND-only lists of atoms. A `!`-pinned atom requests a full
/// stop/start cycle whenever the key changes, even when the service itself
/// accepts the config-reload signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondAtom {
    /// Dotted condition key, e.g. `service/foo/ready` or `net/eth0/up`.
    pub key: String,
    /// Restart-only atom: ignore the service's SIGHUP capability.
    pub pinned: bool,
}

impl CondAtom {
    /// Parses one atom token, honouring a leading `!` pin marker.
    pub fn parse(token: &str) -> Option<Self> {
        let (pinned, key) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        if key.is_empty() {
            return None;
        }
        Some(CondAtom {
            key: key.to_string(),
            pinned,
        })
    }
}

/// Returns the readiness condition key for a service identity.
pub fn ready_cond(name: &str, id: &str) -> String {
    if id.is_empty() {
        format!("service/{name}/ready")
    } else {
        format!("service/{name}:{id}/ready")
    }
}

/// The condition key to tri-state map with filesystem-backed assertion log.
#[derive(Debug)]
pub struct CondStore {
    dir: PathBuf,
    mem: HashMap<String, CondState>,
}

impl CondStore {
    /// Opens a store rooted at `dir`, creating the assertion tree.
    pub fn new(dir: PathBuf) -> Result<Self, CondError> {
        fs::create_dir_all(dir.join("flux"))?;
        Ok(Self {
            dir,
            mem: HashMap::new(),
        })
    }

    /// Returns the current state of `key`; unknown keys are OFF.
    pub fn get(&self, key: &str) -> CondState {
        self.mem.get(key).copied().unwrap_or(CondState::Off)
    }

    /// Asserts `key`. Returns true when the stored value changed.
    pub fn set(&mut self, key: &str) -> bool {
        self.transition(key, CondState::On)
    }

    /// Deasserts `key`. Returns true when the stored value changed.
    pub fn clear(&mut self, key: &str) -> bool {
        self.transition(key, CondState::Off)
    }

    /// Marks `key` as in flux. Returns true when the stored value changed.
    pub fn flux(&mut self, key: &str) -> bool {
        self.transition(key, CondState::Flux)
    }

    /// Moves every ON key below `prefix` to FLUX, returning the moved keys.
    ///
    /// Used by reload: affected conditions must not read as OFF while their
    /// producers are re-evaluated.
    pub fn flux_all(&mut self, prefix: &str) -> Vec<String> {
        let keys: Vec<String> = self
            .mem
            .iter()
            .filter(|(key, state)| key.starts_with(prefix) && **state == CondState::On)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            self.flux(key);
        }
        keys
    }

    /// Drops every remaining FLUX key to OFF. Called after reload converges.
    pub fn settle(&mut self) {
        let keys: Vec<String> = self
            .mem
            .iter()
            .filter(|(_, state)| **state == CondState::Flux)
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            self.clear(&key);
        }
    }

    /// Returns every key currently known to the store, in no fixed order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mem.keys().map(String::as_str)
    }

    fn transition(&mut self, key: &str, next: CondState) -> bool {
        let prev = self.get(key);
        if prev == next {
            return false;
        }

        debug!("cond {key}: {} -> {}", prev.as_ref(), next.as_ref());
        self.mem.insert(key.to_string(), next);
        if let Err(err) = self.persist(key, next) {
            warn!("Failed to persist condition '{key}': {err}");
        }
        true
    }

    fn persist(&self, key: &str, state: CondState) -> Result<(), CondError> {
        let path = self.assert_path(key)?;
        let flux = self.flux_path(key)?;

        match state {
            CondState::On => {
                touch(&path)?;
                remove(&flux)?;
            }
            CondState::Off => {
                remove(&path)?;
                remove(&flux)?;
            }
            CondState::Flux => {
                touch(&path)?;
                touch(&flux)?;
            }
        }
        Ok(())
    }

    fn assert_path(&self, key: &str) -> Result<PathBuf, CondError> {
        Ok(self.dir.join(safe_key(key)?))
    }

    fn flux_path(&self, key: &str) -> Result<PathBuf, CondError> {
        Ok(self.dir.join("flux").join(safe_key(key)?))
    }
}

/// Rejects keys that would escape the store directory or collide with the
/// FLUX marker subtree.
fn safe_key(key: &str) -> Result<&Path, CondError> {
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if key.is_empty() || escapes || key == "flux" || key.starts_with("flux/") {
        return Err(CondError::IllegalKey(key.to_string()));
    }
    Ok(path)
}

fn touch(path: &Path) -> Result<(), CondError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Ok(())
}

fn remove(path: &Path) -> Result<(), CondError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
