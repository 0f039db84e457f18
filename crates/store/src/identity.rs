//! In-memory identity store implementation using DashMap.

use async_trait::async_trait;
use dashmap::DashMap;

use cloudrepl_core::{
    config::IdentityConfig, policy::validate_owner_id, traits::IdentityStore, types::OwnerId,
    types::User, Error, Result,
};

/// In-memory user directory.
///
/// In open mode every syntactically valid owner id resolves to a user;
/// otherwise only registered ids do.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    users: DashMap<OwnerId, User>,
    open: bool,
}

impl InMemoryIdentityStore {
    /// Create an empty, closed store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that accepts any valid owner id.
    pub fn open() -> Self {
        Self {
            users: DashMap::new(),
            open: true,
        }
    }

    /// Build a store from configuration.
    pub fn from_config(config: &IdentityConfig) -> Self {
        let store = Self {
            users: DashMap::new(),
            open: config.open,
        };
        for id in &config.users {
            store.insert(User {
                id: OwnerId::new(id.clone()),
                email: None,
            });
        }
        tracing::info!(users = store.len(), open = store.open, "Identity store initialized");
        if !store.open && store.is_empty() {
            tracing::warn!("Identity store is closed and has no users; every init will be rejected");
        }
        store
    }

    /// Register (or replace) a user.
    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if no users are registered.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_user(&self, owner: &OwnerId) -> Result<User> {
        validate_owner_id(owner)?;

        if let Some(user) = self.users.get(owner) {
            return Ok(user.clone());
        }
        if self.open {
            return Ok(User {
                id: owner.clone(),
                email: None,
            });
        }
        Err(Error::UserNotFound(owner.to_string()))
    }
}
