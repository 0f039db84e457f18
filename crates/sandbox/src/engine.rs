//! Sandbox engine.
//!
//! The `SandboxEngine` is the provisioning authority: it creates, starts,
//! stops, and destroys per-owner containers through a [`SandboxBackend`]
//! and keeps the [`SandboxRegistry`] in step with what is actually running.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::config::SandboxConfig;
use cloudrepl_core::policy::validate_owner_id;
use cloudrepl_core::{Error, OwnerId, ResourceLimits, Result, SandboxId};

use crate::backend::{ContainerSpec, SandboxBackend, MANAGED_BY_LABEL, OWNER_LABEL};
use crate::exec::cancellable;
use crate::registry::SandboxRegistry;

// =============================================================================
// Sandbox Types
// =============================================================================

/// A provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: SandboxId,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
    pub limits: ResourceLimits,
    /// Owner directory on the host.
    pub host_mount_path: PathBuf,
    /// Where that directory appears inside the container.
    pub container_mount_path: String,
    pub image: String,
}

/// Result of [`SandboxEngine::create_sandbox`].
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub sandbox: Sandbox,
    /// The sandbox previously registered for the owner. It is not
    /// destroyed; the caller decides what to do with it.
    pub replaced: Option<SandboxId>,
}

/// Outcome of [`SandboxEngine::stop_all`].
#[derive(Debug, Default, Clone)]
pub struct StopAllReport {
    pub stopped: Vec<SandboxId>,
    pub failed: Vec<(SandboxId, String)>,
}

impl StopAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Sandbox Engine
// =============================================================================

pub struct SandboxEngine {
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<SandboxRegistry>,
    sandboxes: DashMap<SandboxId, Sandbox>,
    config: SandboxConfig,
    /// Held shared by provisioning and destroy, exclusively by `stop_all`,
    /// so a stop-all never observes a half-created sandbox.
    lifecycle: RwLock<()>,
    /// Serializes `ensure_sandbox` per owner. Entries live only while
    /// someone holds or waits for them.
    provisioning: DashMap<OwnerId, Arc<Mutex<()>>>,
    /// Cancelled and replaced by `stop_all`; provisioning runs under the
    /// token current when it started.
    epoch: Mutex<CancellationToken>,
}

impl SandboxEngine {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: SandboxConfig) -> Self {
        Self::with_registry(backend, config, Arc::new(SandboxRegistry::new()))
    }

    pub fn with_registry(
        backend: Arc<dyn SandboxBackend>,
        config: SandboxConfig,
        registry: Arc<SandboxRegistry>,
    ) -> Self {
        Self {
            backend,
            registry,
            sandboxes: DashMap::new(),
            config,
            lifecycle: RwLock::new(()),
            provisioning: DashMap::new(),
            epoch: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The sandbox currently registered for `owner`.
    pub fn resolve(&self, owner: &OwnerId) -> Result<SandboxId> {
        self.registry.resolve(owner)
    }

    pub fn sandbox(&self, id: &SandboxId) -> Option<Sandbox> {
        self.sandboxes.get(id).map(|entry| entry.value().clone())
    }

    /// Create and start a new sandbox for `owner`.
    ///
    /// The owner is registered only once the container is running. An
    /// existing registration is overwritten and its id returned in
    /// [`Provisioned::replaced`].
    ///
    /// Every engine call is abandoned when `cancel` fires or a concurrent
    /// [`stop_all`](Self::stop_all) begins. A container that the engine
    /// reports only after that point is removed in the background.
    pub async fn create_sandbox(
        &self,
        owner: &OwnerId,
        image: &str,
        limits: ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<Provisioned> {
        validate_owner_id(owner)?;
        limits.validate()?;

        // Taken before the gate: a sweep that starts while we wait for the
        // gate must not inherit this create.
        let epoch = self.epoch.lock().await.clone();
        let _gate = cancellable(cancel, "create sandbox", async {
            Ok(self.lifecycle.read().await)
        })
        .await?;

        guarded(cancel, &epoch, "image pull", self.backend.ensure_image(image)).await?;

        let host_mount_path = self.config.host_root.join(owner.as_str());
        tokio::fs::create_dir_all(&host_mount_path)
            .await
            .map_err(|e| {
                Error::internal(format!(
                    "Failed to create host directory {}: {}",
                    host_mount_path.display(),
                    e
                ))
            })?;

        if cancel.is_cancelled() || epoch.is_cancelled() {
            return Err(Error::cancelled("create sandbox"));
        }

        let spec = ContainerSpec {
            name: format!("cloudrepl-{}-{}", owner, uuid::Uuid::new_v4().simple()),
            image: image.to_string(),
            labels: HashMap::from([
                (MANAGED_BY_LABEL.to_string(), self.config.label.clone()),
                (OWNER_LABEL.to_string(), owner.to_string()),
            ]),
            host_mount: host_mount_path.clone(),
            workdir: self.config.container_workdir.clone(),
            limits,
            network_enabled: self.config.network_enabled,
        };

        // The create runs on its own task so it can finish after we give
        // up on it, and its container can still be cleaned up.
        let mut creating = tokio::spawn({
            let backend = self.backend.clone();
            async move { backend.create_container(&spec).await }
        });
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = epoch.cancelled() => None,
            joined = &mut creating => Some(joined),
        };
        let id = match created {
            Some(joined) => joined
                .map_err(|e| Error::internal(format!("Container create task failed: {}", e)))??,
            None => {
                tracing::info!(owner_id = %owner, "Sandbox create cancelled while the engine was busy");
                self.discard_late(creating);
                return Err(Error::cancelled("create sandbox"));
            }
        };

        let started = guarded(cancel, &epoch, "start sandbox", self.backend.start_container(&id)).await;
        match started {
            Ok(()) => {}
            Err(e @ Error::Cancelled(_)) => {
                tracing::info!(sandbox_id = %id, owner_id = %owner, "Sandbox start cancelled, removing it");
                let backend = self.backend.clone();
                tokio::spawn(async move { remove_quietly(backend.as_ref(), &id).await });
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %id, owner_id = %owner, error = %e, "Sandbox failed to start, removing it");
                remove_quietly(self.backend.as_ref(), &id).await;
                return Err(e);
            }
        }

        let sandbox = Sandbox {
            id: id.clone(),
            owner_id: owner.clone(),
            created_at: Utc::now(),
            limits,
            host_mount_path,
            container_mount_path: self.config.container_workdir.clone(),
            image: image.to_string(),
        };
        self.sandboxes.insert(id.clone(), sandbox.clone());
        let replaced = self.registry.register(owner.clone(), id.clone());

        metrics::counter!("sandbox_created_total", "image" => image.to_string()).increment(1);
        tracing::info!(
            sandbox_id = %id,
            owner_id = %owner,
            image = %image,
            replaced = ?replaced,
            "Sandbox created and started"
        );

        Ok(Provisioned { sandbox, replaced })
    }

    fn discard_late(&self, creating: JoinHandle<Result<SandboxId>>) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Ok(Ok(id)) = creating.await {
                tracing::info!(sandbox_id = %id, "Removing sandbox created after cancellation");
                remove_quietly(backend.as_ref(), &id).await;
            }
        });
    }

    /// The running sandbox for `owner`, creating one with the configured
    /// image and limits if there is none.
    ///
    /// A registered sandbox whose container is no longer running is
    /// destroyed and replaced.
    pub async fn ensure_sandbox(&self, owner: &OwnerId, cancel: &CancellationToken) -> Result<Sandbox> {
        validate_owner_id(owner)?;

        let lock = self
            .provisioning
            .entry(owner.clone())
            .or_default()
            .clone();
        let result = self.ensure_locked(owner, &lock, cancel).await;

        drop(lock);
        self.provisioning
            .remove_if(owner, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn ensure_locked(
        &self,
        owner: &OwnerId,
        lock: &Mutex<()>,
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        let _guard = cancellable(cancel, "ensure sandbox", async { Ok(lock.lock().await) }).await?;

        if let Some(id) = self.registry.lookup(owner) {
            if let Some(sandbox) = self.sandbox(&id) {
                if cancellable(cancel, "ensure sandbox", self.backend.is_running(&id)).await? {
                    return Ok(sandbox);
                }
            }
            tracing::warn!(sandbox_id = %id, owner_id = %owner, "Registered sandbox is gone, replacing it");
            match self.destroy_sandbox(&id, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let image = self.config.image.clone();
        let provisioned = self
            .create_sandbox(owner, &image, self.config.limits, cancel)
            .await?;
        Ok(provisioned.sandbox)
    }

    /// Stop (zero grace) and force-remove a sandbox.
    ///
    /// Unknown ids fail with `NotFound`, so a second call on the same id
    /// reports `NotFound` instead of succeeding silently. `cancel` abandons
    /// a stop or remove the engine never answers.
    pub async fn destroy_sandbox(&self, id: &SandboxId, cancel: &CancellationToken) -> Result<()> {
        let _gate = cancellable(cancel, "destroy sandbox", async {
            Ok(self.lifecycle.read().await)
        })
        .await?;

        match cancellable(cancel, "stop sandbox", self.backend.stop_container(id, Duration::ZERO)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.forget(id);
                return Err(Error::not_found(format!("sandbox {}", id)));
            }
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Stop failed, forcing removal");
            }
        }

        match cancellable(cancel, "remove sandbox", self.backend.remove_container(id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.forget(id);
                return Err(Error::not_found(format!("sandbox {}", id)));
            }
            Err(e) => return Err(e),
        }

        self.forget(id);
        metrics::counter!("sandbox_destroyed_total").increment(1);
        tracing::info!(sandbox_id = %id, "Sandbox destroyed");
        Ok(())
    }

    /// Force-stop and remove every sandbox carrying this engine's
    /// management label, including ones started by other processes.
    ///
    /// Provisioning already in flight is cancelled first, so the sweep
    /// never waits on a create the engine is not answering. Individual
    /// failures do not stop the sweep; they are collected in the report,
    /// as is every sandbox left unvisited once `cancel` fires. Registry
    /// entries of stopped sandboxes are dropped.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> Result<StopAllReport> {
        let ended = std::mem::replace(&mut *self.epoch.lock().await, CancellationToken::new());
        ended.cancel();

        let _gate = cancellable(cancel, "stop all", async { Ok(self.lifecycle.write().await) }).await?;

        let ids = cancellable(cancel, "list sandboxes", self.backend.list_managed(&self.config.label))
            .await?;
        let mut report = StopAllReport::default();

        for id in ids {
            if cancel.is_cancelled() {
                report.failed.push((id, "sweep cancelled".to_string()));
                continue;
            }

            match cancellable(cancel, "stop sandbox", self.backend.stop_container(&id, Duration::ZERO)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    self.forget(&id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Failed to stop sandbox");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            }

            // Stopped is enough to drop the mapping; a failed remove only
            // leaves a stopped container behind.
            self.forget(&id);
            match cancellable(cancel, "remove sandbox", self.backend.remove_container(&id)).await {
                Ok(()) => {
                    metrics::counter!("sandbox_destroyed_total").increment(1);
                    report.stopped.push(id);
                }
                Err(e) if e.is_not_found() => report.stopped.push(id),
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Stopped sandbox could not be removed");
                    report.failed.push((id, format!("stopped but not removed: {}", e)));
                }
            }
        }

        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Stopped all sandboxes"
        );
        Ok(report)
    }

    fn forget(&self, id: &SandboxId) {
        self.sandboxes.remove(id);
        self.registry.remove_sandbox(id);
    }
}

/// Run `fut` until the caller cancels or the provisioning epoch ends.
async fn guarded<T>(
    cancel: &CancellationToken,
    epoch: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    cancellable(cancel, what, cancellable(epoch, what, fut)).await
}

async fn remove_quietly(backend: &dyn SandboxBackend, id: &SandboxId) {
    if let Err(e) = backend.remove_container(id).await {
        if !e.is_not_found() {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to remove unstarted sandbox");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn engine(backend: &MockBackend, root: &std::path::Path) -> SandboxEngine {
        let config = SandboxConfig {
            host_root: root.to_path_buf(),
            ..Default::default()
        };
        SandboxEngine::new(Arc::new(backend.clone()), config)
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id)
    }

    #[tokio::test]
    async fn test_create_registers_after_start() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());

        let provisioned = engine
            .create_sandbox(
                &owner("u1"),
                "node:lts-alpine",
                ResourceLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sandbox = provisioned.sandbox;
        assert!(provisioned.replaced.is_none());
        assert_eq!(engine.resolve(&owner("u1")).unwrap(), sandbox.id);
        assert!(backend.is_running(&sandbox.id).await.unwrap());
        assert!(root.path().join("u1").is_dir());
        assert_eq!(sandbox.host_mount_path, root.path().join("u1"));
        assert_eq!(sandbox.container_mount_path, "/work");
        assert_eq!(backend.pulled_images().await, vec!["node:lts-alpine"]);

        let labels = backend.container_labels(&sandbox.id).await.unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL).unwrap(), "cloudrepl-sandbox");
        assert_eq!(labels.get(OWNER_LABEL).unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_create_replaces_mapping() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        let first = engine
            .create_sandbox(&owner("u1"), "node:lts-alpine", ResourceLimits::default(), &cancel)
            .await
            .unwrap();
        let second = engine
            .create_sandbox(&owner("u1"), "node:lts-alpine", ResourceLimits::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(second.replaced, Some(first.sandbox.id.clone()));
        assert_eq!(engine.resolve(&owner("u1")).unwrap(), second.sandbox.id);
        // The replaced sandbox is left running for the caller to handle.
        assert!(backend.is_running(&first.sandbox.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected_before_engine() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());

        let result = engine
            .create_sandbox(
                &owner("u1"),
                "node:lts-alpine",
                ResourceLimits {
                    memory_bytes: 1,
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::ResourceLimitInvalid(_))));
        assert_eq!(backend.container_count().await, 0);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_image_pull_failure() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.break_image("ghost:latest").await;
        let engine = engine(&backend, root.path());

        let result = engine
            .create_sandbox(
                &owner("u1"),
                "ghost:latest",
                ResourceLimits::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::ImagePullFailure { .. })));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_removes_container() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.fail_start(true);
        let engine = engine(&backend, root.path());

        let result = engine
            .create_sandbox(
                &owner("u1"),
                "node:lts-alpine",
                ResourceLimits::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::EngineUnavailable(_))));
        assert_eq!(backend.container_count().await, 0);
        assert!(engine.resolve(&owner("u1")).is_err());
    }

    #[tokio::test]
    async fn test_engine_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.set_available(false);
        let engine = engine(&backend, root.path());

        let result = engine
            .ensure_sandbox(&owner("u1"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_owner_rejected() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());

        let result = engine
            .ensure_sandbox(&owner("../escape"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert!(!root.path().join("../escape").exists());
    }

    #[tokio::test]
    async fn test_ensure_reuses_running_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        let first = engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        let again = engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(backend.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_ensure_replaces_crashed_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        let first = engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        backend.crash(&first.id).await;

        let second = engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(backend.container_count().await, 1);
        assert_eq!(engine.resolve(&owner("u1")).unwrap(), second.id);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_once() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = Arc::new(engine(&backend, root.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .ensure_sandbox(&OwnerId::new("u1"), &CancellationToken::new())
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(backend.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());

        let sandbox = engine
            .ensure_sandbox(&owner("u1"), &CancellationToken::new())
            .await
            .unwrap();
        std::fs::write(root.path().join("u1").join("keep.txt"), b"state").unwrap();

        engine.destroy_sandbox(&sandbox.id, &CancellationToken::new()).await.unwrap();
        assert!(engine.resolve(&owner("u1")).is_err());
        assert!(engine.sandbox(&sandbox.id).is_none());
        assert_eq!(backend.container_count().await, 0);

        let again = engine.destroy_sandbox(&sandbox.id, &CancellationToken::new()).await;
        assert!(matches!(again, Err(Error::NotFound(_))));

        // Host directories outlive their sandboxes.
        assert!(root.path().join("u1").join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_destroy_unknown_id() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(&MockBackend::new(), root.path());
        let result = engine
            .destroy_sandbox(&SandboxId("missing".into()), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_all_covers_other_engines() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let ours = engine(&backend, root.path());
        let theirs = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        let a = ours.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        let b = theirs.ensure_sandbox(&owner("u2"), &cancel).await.unwrap();
        let c = ours.ensure_sandbox(&owner("u3"), &cancel).await.unwrap();
        backend.fail_stop(&c.id).await;

        let report = ours.stop_all(&cancel).await.unwrap();

        let mut stopped = report.stopped.clone();
        stopped.sort_by(|x, y| x.0.cmp(&y.0));
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(stopped, expected);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, c.id);
        assert!(!report.is_clean());

        assert_eq!(backend.running_count().await, 1);
        assert_eq!(backend.container_count().await, 1);
        assert!(ours.resolve(&owner("u1")).is_err());
        assert_eq!(ours.resolve(&owner("u3")).unwrap(), c.id);
    }

    #[tokio::test]
    async fn test_stop_all_ignores_foreign_labels() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let ours = engine(&backend, root.path());
        let other_deployment = SandboxEngine::new(
            Arc::new(backend.clone()),
            SandboxConfig {
                host_root: root.path().to_path_buf(),
                label: "someone-else".into(),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        ours.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        let foreign = other_deployment
            .ensure_sandbox(&owner("u2"), &cancel)
            .await
            .unwrap();

        let report = ours.stop_all(&cancel).await.unwrap();
        assert_eq!(report.stopped.len(), 1);
        assert!(backend.is_running(&foreign.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_create_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .create_sandbox(&owner("u1"), "node:lts-alpine", ResourceLimits::default(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(backend.container_count().await, 0);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_removes_containers() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        engine.ensure_sandbox(&owner("u2"), &cancel).await.unwrap();

        let report = engine.stop_all(&cancel).await.unwrap();
        assert_eq!(report.stopped.len(), 2);
        assert_eq!(backend.container_count().await, 0);
        assert!(engine.registry().is_empty());

        let again = engine.stop_all(&cancel).await.unwrap();
        assert!(again.stopped.is_empty());
        assert!(again.is_clean());
    }

    #[tokio::test]
    async fn test_provisioning_locks_are_released() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        engine.ensure_sandbox(&owner("u1"), &cancel).await.unwrap();
        backend.set_available(false);
        assert!(engine.ensure_sandbox(&owner("u2"), &cancel).await.is_err());

        assert!(engine.provisioning.is_empty());
    }

    #[tokio::test]
    async fn test_hung_create_is_cancelled() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.stall("create_container", None).await;
        let engine = Arc::new(engine(&backend, root.path()));
        let cancel = CancellationToken::new();

        let create = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move {
                engine
                    .create_sandbox(&owner("u1"), "node:lts-alpine", ResourceLimits::default(), &cancel)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), create)
            .await
            .expect("create ignored cancellation")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            engine.stop_all(&CancellationToken::new()),
        )
        .await
        .expect("sweep blocked behind a cancelled create")
        .unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_stop_all_cancels_hung_provisioning() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend.stall("create_container", None).await;
        let engine = Arc::new(engine(&backend, root.path()));

        let create = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .ensure_sandbox(&owner("u1"), &CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), engine.stop_all(&CancellationToken::new()))
            .await
            .expect("sweep waited on a hung create")
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), create)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_late_container_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend
            .stall("create_container", Some(Duration::from_millis(200)))
            .await;
        let engine = engine(&backend, root.path());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = engine
            .create_sandbox(&owner("u1"), "node:lts-alpine", ResourceLimits::default(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));

        // The engine still creates the container; it must not linger.
        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.container_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("late container was not removed");
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_hung_stop_gives_up_on_cancel() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        let engine = engine(&backend, root.path());
        let sandbox = engine
            .ensure_sandbox(&owner("u1"), &CancellationToken::new())
            .await
            .unwrap();
        backend.stall("stop_container", None).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let destroyed = tokio::time::timeout(
            Duration::from_secs(2),
            engine.destroy_sandbox(&sandbox.id, &cancel),
        )
        .await
        .expect("destroy ignored cancellation");
        assert!(matches!(destroyed, Err(Error::Cancelled(_))));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(2), engine.stop_all(&cancel))
            .await
            .expect("sweep ignored cancellation")
            .unwrap();
        assert!(report.stopped.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, sandbox.id);
        assert_eq!(engine.resolve(&owner("u1")).unwrap(), sandbox.id);
    }

    #[tokio::test]
    async fn test_concurrent_create_and_stop_all() {
        let root = tempfile::tempdir().unwrap();
        let backend = MockBackend::new();
        backend
            .stall("start_container", Some(Duration::from_millis(5)))
            .await;
        let engine = Arc::new(engine(&backend, root.path()));

        let mut creates = Vec::new();
        for n in 0..12 {
            let engine = engine.clone();
            creates.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(n * 2)).await;
                engine
                    .ensure_sandbox(&OwnerId::new(format!("u{}", n)), &CancellationToken::new())
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(8)).await;
        let report = engine.stop_all(&CancellationToken::new()).await.unwrap();
        assert!(report.is_clean());

        let mut survivors = Vec::new();
        for create in creates {
            match create.await.unwrap() {
                Ok(sandbox) => survivors.push(sandbox.id),
                Err(e) => assert!(matches!(e, Error::Cancelled(_)), "unexpected {:?}", e),
            }
        }

        for id in &report.stopped {
            assert!(!survivors.contains(id) || engine.sandbox(id).is_none());
            assert!(!backend.is_running(id).await.unwrap());
        }
        let live: Vec<_> = survivors
            .iter()
            .filter(|id| engine.sandbox(id).is_some())
            .collect();
        for id in &live {
            assert!(backend.is_running(id).await.unwrap());
        }

        // Whatever the sweep did not take is registered; nothing is orphaned.
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.container_count().await != live.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("orphaned containers after the sweep");
        assert_eq!(engine.registry().len(), live.len());
    }
}
