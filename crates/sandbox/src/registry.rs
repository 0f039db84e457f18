//! Owner → sandbox mapping.

use dashmap::DashMap;

use cloudrepl_core::{Error, OwnerId, Result, SandboxId};

/// Concurrent mapping from owner to the sandbox currently serving it.
///
/// Each call is a single atomic map operation; lookups never wait on
/// sandbox state. Owned by the engine and shared by `Arc`.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: DashMap<OwnerId, SandboxId>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `owner` to `sandbox`, returning the sandbox it replaced, if any.
    pub fn register(&self, owner: OwnerId, sandbox: SandboxId) -> Option<SandboxId> {
        self.entries.insert(owner, sandbox)
    }

    pub fn lookup(&self, owner: &OwnerId) -> Option<SandboxId> {
        self.entries.get(owner).map(|entry| entry.value().clone())
    }

    /// Like [`lookup`](Self::lookup) but fails with `SandboxNotFound`.
    pub fn resolve(&self, owner: &OwnerId) -> Result<SandboxId> {
        self.lookup(owner).ok_or_else(|| {
            Error::sandbox_not_found(format!("no sandbox registered for user {}", owner))
        })
    }

    pub fn remove(&self, owner: &OwnerId) -> Option<SandboxId> {
        self.entries.remove(owner).map(|(_, sandbox)| sandbox)
    }

    /// Remove the entry for `owner` only if it still points at `sandbox`.
    pub fn remove_if(&self, owner: &OwnerId, sandbox: &SandboxId) -> bool {
        self.entries
            .remove_if(owner, |_, current| current == sandbox)
            .is_some()
    }

    /// Drop every entry pointing at `sandbox`. Returns how many were removed.
    pub fn remove_sandbox(&self, sandbox: &SandboxId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, current| current != sandbox);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
