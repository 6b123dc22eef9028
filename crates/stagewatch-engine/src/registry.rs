use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub key: String,
    pub owner: OwnerId,
}

pub type Claims = BTreeMap<String, OwnerId>;

/// Process-local ledger of which consumer currently polls each resource key.
///
/// Every mutation is applied synchronously through a single `watch` value, so no observer can
/// see two owners for one key.
#[derive(Clone)]
pub struct PollRegistry {
    claims: Arc<watch::Sender<Claims>>,
}

impl Default for PollRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PollRegistry {
    pub fn new() -> Self {
        let (claims, _) = watch::channel(Claims::new());
        Self {
            claims: Arc::new(claims),
        }
    }

    /// Makes `owner` the poller of `key` and returns the owner it superseded, if any.
    pub fn claim(&self, key: impl Into<String>, owner: &OwnerId) -> Option<OwnerId> {
        let key = key.into();
        let mut previous = None;
        self.claims.send_modify(|claims| {
            previous = claims.insert(key.clone(), owner.clone());
        });
        let previous = previous.filter(|prior| prior != owner);
        if let Some(prior) = &previous {
            debug!(event = "poll_claim_superseded", key = %key, previous = %prior, owner = %owner);
        }
        previous
    }

    /// Drops the claim only while `owner` still holds it.
    pub fn release(&self, key: &str, owner: &OwnerId) -> bool {
        self.claims.send_if_modified(|claims| {
            if claims.get(key) == Some(owner) {
                claims.remove(key);
                true
            } else {
                false
            }
        })
    }

    pub fn owner_of(&self, key: &str) -> Option<OwnerId> {
        self.claims.borrow().get(key).cloned()
    }

    pub fn is_owner(&self, key: &str, owner: &OwnerId) -> bool {
        self.claims.borrow().get(key) == Some(owner)
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.claims
            .borrow()
            .iter()
            .map(|(key, owner)| RegistryEntry {
                key: key.clone(),
                owner: owner.clone(),
            })
            .collect()
    }

    /// Stream of the claimed keys; yields the full ledger after every change.
    pub fn owners_of(&self) -> watch::Receiver<Claims> {
        self.claims.subscribe()
    }

    /// Resolves once `owner` no longer holds `key`.
    pub async fn superseded(&self, key: &str, owner: &OwnerId) {
        let mut claims = self.claims.subscribe();
        let _ = claims
            .wait_for(|claims| claims.get(key) != Some(owner))
            .await;
    }
}
