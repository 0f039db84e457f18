//! Docker backend using the `bollard` crate.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;

use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;

use cloudrepl_core::{Error, ExecId, Result, SandboxId, StreamKind};

use crate::backend::{ContainerSpec, ExecAttachment, ExecSpec, SandboxBackend, MANAGED_BY_LABEL};
use crate::codec::encode_frame;

/// Sandbox backend talking to a local Docker daemon.
///
/// Containers are created with:
/// - The owner's host directory bind-mounted at the working directory
/// - No network (`network_mode = none`) unless enabled in config
/// - Memory and CPU limits
/// - All capabilities dropped and no privilege escalation
/// - A PID limit against fork bombs
pub struct DockerBackend {
    docker: bollard::Docker,
}

/// Largest number of processes a sandbox may run at once.
const PIDS_LIMIT: i64 = 256;

impl DockerBackend {
    /// Connect to the local Docker daemon using the platform defaults
    /// (`DOCKER_HOST` or the default socket).
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::engine_unavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

/// Map a daemon error for an operation on `target`.
///
/// 404 means the container (or exec) is gone; 409 on a container means it
/// exists but is not running, which callers treat the same way.
fn map_docker_error(op: &str, target: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => Error::sandbox_not_found(format!("{}: {}", target, message)),
        other => Error::engine_unavailable(format!("{} {}: {}", op, target, other)),
    }
}

/// Split `image[:tag]` into name and tag, ignoring a registry port such as
/// `localhost:5000/img`.
fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

/// Convert one demultiplexed chunk back into attach-stream bytes.
///
/// Non-TTY output is re-encoded into frames so callers decode a single wire
/// format regardless of backend. TTY output passes through raw.
fn chunk_to_wire(output: LogOutput, tty: bool) -> io::Result<Option<Bytes>> {
    let (kind, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (StreamKind::Stdout, message)
        }
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::StdIn { .. } => return Ok(None),
    };
    if message.is_empty() {
        return Ok(None);
    }
    if tty {
        return Ok(Some(message));
    }
    encode_frame(kind, &message)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::engine_unavailable(format!("Docker daemon not reachable: {}", e)))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        use bollard::image::CreateImageOptions;

        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_ref(image);
        tracing::info!(image = %image, "Pulling sandbox image");

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: from_image.to_string(),
                    tag: tag.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| Error::image_pull(image, e.to_string()))?;

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<SandboxId> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let limits = &spec.limits;
        let host_config = HostConfig {
            memory: Some(limits.memory_bytes),
            cpu_shares: (limits.cpu_shares > 0).then_some(limits.cpu_shares),
            cpu_quota: (limits.cpu_quota_micros > 0).then_some(limits.cpu_quota_micros),
            cpu_period: Some(limits.cpu_period_micros),
            binds: Some(vec![format!(
                "{}:{}",
                spec.host_mount.to_string_lossy(),
                spec.workdir
            )]),
            network_mode: if spec.network_enabled {
                Some("bridge".to_string())
            } else {
                Some("none".to_string())
            },
            // Drop all capabilities by default
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(PIDS_LIMIT),
            ..Default::default()
        };

        // A TTY shell with stdin held open keeps the container alive
        // between execs.
        let container_config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.workdir.clone()),
            cmd: Some(vec!["sh".to_string()]),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => Error::image_pull(&spec.image, message),
                other => Error::engine_unavailable(format!(
                    "Failed to create sandbox container: {}",
                    other
                )),
            })?;

        for warning in &created.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker warning on create");
        }

        Ok(SandboxId(created.id))
    }

    async fn start_container(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .start_container::<String>(id.as_str(), None)
            .await
            .map_err(|e| map_docker_error("start", id.as_str(), e))
    }

    async fn stop_container(&self, id: &SandboxId, grace: Duration) -> Result<()> {
        use bollard::container::StopContainerOptions;

        match self
            .docker
            .stop_container(
                id.as_str(),
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            }) => Err(Error::sandbox_not_found(format!("{}: {}", id, message))),
            Err(e) => Err(Error::engine_unavailable(format!("stop {}: {}", id, e))),
        }
    }

    async fn remove_container(&self, id: &SandboxId) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => Error::sandbox_not_found(format!("{}: {}", id, message)),
                other => Error::engine_unavailable(format!("remove {}: {}", id, other)),
            })
    }

    async fn is_running(&self, id: &SandboxId) -> Result<bool> {
        use bollard::container::InspectContainerOptions;

        match self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::engine_unavailable(format!("inspect {}: {}", id, e))),
        }
    }

    async fn list_managed(&self, label: &str) -> Result<Vec<SandboxId>> {
        use bollard::container::ListContainersOptions;

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", MANAGED_BY_LABEL, label)],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::engine_unavailable(format!("list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| summary.id.map(SandboxId))
            .collect())
    }

    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> Result<ExecId> {
        use bollard::exec::CreateExecOptions;

        let options = CreateExecOptions {
            cmd: Some(spec.argv.clone()),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            working_dir: spec.workdir.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|e| map_docker_error("create exec in", id.as_str(), e))?;

        Ok(ExecId(created.id))
    }

    async fn attach_exec(&self, exec: &ExecId, tty: bool) -> Result<ExecAttachment> {
        use bollard::exec::{StartExecOptions, StartExecResults};

        let started = self
            .docker
            .start_exec(
                &exec.0,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| map_docker_error("start exec", &exec.0, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let wire = output.filter_map(move |chunk| async move {
                    match chunk {
                        Ok(log) => chunk_to_wire(log, tty).transpose(),
                        Err(e) => Some(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            e.to_string(),
                        ))),
                    }
                });
                Ok(ExecAttachment {
                    output: Box::pin(StreamReader::new(Box::pin(wire))),
                    input,
                })
            }
            StartExecResults::Detached => Err(Error::stream(format!(
                "exec {} started detached, no streams to attach",
                exec
            ))),
        }
    }

    async fn resize_exec(&self, exec: &ExecId, rows: u16, cols: u16) -> Result<()> {
        use bollard::exec::ResizeExecOptions;

        self.docker
            .resize_exec(
                &exec.0,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| map_docker_error("resize exec", &exec.0, e))
    }

    async fn exec_exit_code(&self, exec: &ExecId) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(&exec.0)
            .await
            .map_err(|e| map_docker_error("inspect exec", &exec.0, e))?;
        Ok(inspect.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("node:lts-alpine"), ("node", "lts-alpine"));
        assert_eq!(split_image_ref("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_image_ref("localhost:5000/team/img"),
            ("localhost:5000/team/img", "latest")
        );
        assert_eq!(
            split_image_ref("localhost:5000/team/img:1.2"),
            ("localhost:5000/team/img", "1.2")
        );
    }

    #[test]
    fn test_chunk_to_wire_reframes_non_tty_output() {
        let wire = chunk_to_wire(
            LogOutput::StdErr {
                message: Bytes::from_static(b"boom"),
            },
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(&wire[..], &[2, 0, 0, 0, 0, 0, 0, 4, b'b', b'o', b'o', b'm']);
    }

    #[test]
    fn test_chunk_to_wire_tty_is_raw() {
        let wire = chunk_to_wire(
            LogOutput::Console {
                message: Bytes::from_static(b"$ "),
            },
            true,
        )
        .unwrap()
        .unwrap();
        assert_eq!(&wire[..], b"$ ");
    }

    #[test]
    fn test_chunk_to_wire_skips_stdin_and_empty() {
        assert!(chunk_to_wire(
            LogOutput::StdIn {
                message: Bytes::from_static(b"echo"),
            },
            false
        )
        .unwrap()
        .is_none());
        assert!(chunk_to_wire(
            LogOutput::StdOut {
                message: Bytes::new(),
            },
            false
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn test_not_found_mapping() {
        let err = map_docker_error(
            "create exec in",
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container: abc".into(),
            },
        );
        assert!(matches!(err, Error::SandboxNotFound(_)));

        let err = map_docker_error(
            "create exec in",
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "daemon exploded".into(),
            },
        );
        assert!(matches!(err, Error::EngineUnavailable(_)));
    }
}
