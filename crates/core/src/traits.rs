//! Seams between the session engine and its collaborators.

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{OwnerId, StreamKind, User};
use crate::Result;

/// Destination for process output.
///
/// The transport owns the implementation (for example, wrapping each chunk
/// into a WebSocket JSON frame); the engine only writes bytes to it.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one chunk of output.
    async fn write(&self, kind: StreamKind, data: Bytes) -> Result<()>;
}

/// Lookup of known users, consulted before provisioning a sandbox.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Find a user by id, failing with `Error::UserNotFound` when unknown.
    async fn find_user(&self, owner: &OwnerId) -> Result<User>;
}
