//! In-memory container backend for testing without Docker.
//!
//! Containers are plain records. Commands are interpreted directly against
//! the container's host mount, so files written through the engine really
//! land in the owner's host directory. The interpreter understands the
//! argvs built by [`FileOps`](crate::files::FileOps) plus `echo`, `true`,
//! `false` and `sleep`. A TTY exec of a shell starts an echo shell: it
//! echoes input back and exits with `N` on an `exit N` line.

use async_trait::async_trait;
use base64::Engine;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::{Error, ExecId, Result, SandboxId, StreamKind};

use crate::backend::{ContainerSpec, ExecAttachment, ExecSpec, SandboxBackend, MANAGED_BY_LABEL};
use crate::codec::encode_frame;
use crate::files::{APPEND_SCRIPT, LIST_SCRIPT, STAT_FORMAT, WRITE_SCRIPT};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Exit code of a process killed by its container stopping.
const KILLED_EXIT_CODE: i64 = 137;

const SHELLS: &[&str] = &["sh", "ash", "bash", "node"];

/// In-memory sandbox backend.
///
/// Clones share state, so two engines built on clones of one backend see
/// the same containers (like two processes talking to one daemon).
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    unavailable: AtomicBool,
    fail_start: AtomicBool,
    fail_resize: AtomicBool,
    broken_images: Mutex<HashSet<String>>,
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<SandboxId, MockContainer>>,
    execs: Mutex<HashMap<ExecId, MockExec>>,
    resizes: Mutex<Vec<(ExecId, u16, u16)>>,
    stop_failures: Mutex<HashSet<SandboxId>>,
    stalls: Mutex<HashMap<&'static str, Option<Duration>>>,
}

struct MockContainer {
    name: String,
    labels: HashMap<String, String>,
    host_mount: PathBuf,
    workdir: String,
    running: bool,
    kill: CancellationToken,
}

struct MockExec {
    container: SandboxId,
    spec: ExecSpec,
    started: bool,
    exit_code: Arc<Mutex<Option<i64>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the daemon going away (`false`) or coming back.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make every container start fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every terminal resize fail.
    pub fn fail_resize(&self, fail: bool) {
        self.state.fail_resize.store(fail, Ordering::SeqCst);
    }

    /// Make pulling `image` fail.
    pub async fn break_image(&self, image: &str) {
        self.state.broken_images.lock().await.insert(image.to_string());
    }

    /// Make stopping `id` fail with an engine error.
    pub async fn fail_stop(&self, id: &SandboxId) {
        self.state.stop_failures.lock().await.insert(id.clone());
    }

    /// Stop a container behind the engine's back, as if it crashed.
    pub async fn crash(&self, id: &SandboxId) {
        if let Some(container) = self.state.containers.lock().await.get_mut(id) {
            container.running = false;
            container.kill.cancel();
        }
    }

    pub async fn pulled_images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.state.images.lock().await.iter().cloned().collect();
        images.sort();
        images
    }

    pub async fn container_count(&self) -> usize {
        self.state.containers.lock().await.len()
    }

    pub async fn running_count(&self) -> usize {
        self.state
            .containers
            .lock()
            .await
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub async fn container_name(&self, id: &SandboxId) -> Option<String> {
        self.state
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.name.clone())
    }

    pub async fn container_labels(&self, id: &SandboxId) -> Option<HashMap<String, String>> {
        self.state
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.labels.clone())
    }

    /// Every resize request the backend accepted, in order.
    pub async fn resizes(&self) -> Vec<(ExecId, u16, u16)> {
        self.state.resizes.lock().await.clone()
    }

    /// Delay every call to the backend method named `call` by `delay`
    /// before it does any work, or hang it forever when `delay` is `None`.
    pub async fn stall(&self, call: &'static str, delay: Option<Duration>) {
        self.state.stalls.lock().await.insert(call, delay);
    }

    pub async fn unstall(&self, call: &'static str) {
        self.state.stalls.lock().await.remove(call);
    }

    async fn maybe_stall(&self, call: &str) {
        let stall = self.state.stalls.lock().await.get(call).copied();
        match stall {
            Some(Some(delay)) => tokio::time::sleep(delay).await,
            Some(None) => futures::future::pending::<()>().await,
            None => {}
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(Error::engine_unavailable("mock engine is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.check_available()?;
        if self.state.broken_images.lock().await.contains(image) {
            return Err(Error::image_pull(image, "manifest unknown"));
        }
        self.state.images.lock().await.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<SandboxId> {
        self.maybe_stall("create_container").await;
        self.check_available()?;
        let mut containers = self.state.containers.lock().await;
        if containers.values().any(|c| c.name == spec.name) {
            return Err(Error::engine_unavailable(format!(
                "Conflict. The container name \"{}\" is already in use",
                spec.name
            )));
        }

        let id = SandboxId(format!("mock-{}", uuid::Uuid::new_v4().simple()));
        containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                host_mount: spec.host_mount.clone(),
                workdir: spec.workdir.trim_end_matches('/').to_string(),
                running: false,
                kill: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &SandboxId) -> Result<()> {
        self.maybe_stall("start_container").await;
        self.check_available()?;
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(Error::engine_unavailable("mock start failure"));
        }
        let mut containers = self.state.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| Error::sandbox_not_found(id.to_string()))?;
        if !container.running {
            container.running = true;
            container.kill = CancellationToken::new();
        }
        Ok(())
    }

    async fn stop_container(&self, id: &SandboxId, _grace: Duration) -> Result<()> {
        self.maybe_stall("stop_container").await;
        self.check_available()?;
        if self.state.stop_failures.lock().await.contains(id) {
            return Err(Error::engine_unavailable(format!("cannot stop {}", id)));
        }
        let mut containers = self.state.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| Error::sandbox_not_found(id.to_string()))?;
        container.running = false;
        container.kill.cancel();
        Ok(())
    }

    async fn remove_container(&self, id: &SandboxId) -> Result<()> {
        self.maybe_stall("remove_container").await;
        self.check_available()?;
        let container = self
            .state
            .containers
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::sandbox_not_found(id.to_string()))?;
        container.kill.cancel();
        self.state
            .execs
            .lock()
            .await
            .retain(|_, exec| &exec.container != id);
        Ok(())
    }

    async fn is_running(&self, id: &SandboxId) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .state
            .containers
            .lock()
            .await
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn list_managed(&self, label: &str) -> Result<Vec<SandboxId>> {
        self.maybe_stall("list_managed").await;
        self.check_available()?;
        let mut ids: Vec<SandboxId> = self
            .state
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(label))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> Result<ExecId> {
        self.check_available()?;
        match self.state.containers.lock().await.get(id) {
            None => return Err(Error::sandbox_not_found(id.to_string())),
            Some(c) if !c.running => {
                return Err(Error::sandbox_not_found(format!("{} is not running", id)))
            }
            Some(_) => {}
        }

        let exec_id = ExecId(format!("exec-{}", uuid::Uuid::new_v4().simple()));
        self.state.execs.lock().await.insert(
            exec_id.clone(),
            MockExec {
                container: id.clone(),
                spec: spec.clone(),
                started: false,
                exit_code: Arc::new(Mutex::new(None)),
            },
        );
        Ok(exec_id)
    }

    async fn attach_exec(&self, exec: &ExecId, tty: bool) -> Result<ExecAttachment> {
        self.check_available()?;
        let (container_id, spec, exit_code) = {
            let mut execs = self.state.execs.lock().await;
            let entry = execs
                .get_mut(exec)
                .ok_or_else(|| Error::not_found(format!("exec {}", exec)))?;
            if entry.started {
                return Err(Error::stream(format!("exec {} already started", exec)));
            }
            entry.started = true;
            (entry.container.clone(), entry.spec.clone(), entry.exit_code.clone())
        };

        let (fs, kill) = {
            let containers = self.state.containers.lock().await;
            let container = containers
                .get(&container_id)
                .ok_or_else(|| Error::sandbox_not_found(container_id.to_string()))?;
            (
                MockFs {
                    host_mount: container.host_mount.clone(),
                    workdir: container.workdir.clone(),
                },
                container.kill.clone(),
            )
        };

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);

        if tty && spec.argv.len() == 1 && SHELLS.contains(&spec.argv[0].as_str()) {
            tokio::spawn(echo_shell(server, exit_code, kill));
            let (output, input) = tokio::io::split(client);
            return Ok(ExecAttachment {
                output: Box::pin(output),
                input: Box::pin(input),
            });
        }

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = fs.run(&spec.argv) => outcome,
                _ = kill.cancelled() => Outcome::exit(KILLED_EXIT_CODE),
            };
            write_outcome(server, outcome, tty, exit_code).await;
        });

        Ok(ExecAttachment {
            output: Box::pin(client),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn resize_exec(&self, exec: &ExecId, rows: u16, cols: u16) -> Result<()> {
        self.maybe_stall("resize_exec").await;
        self.check_available()?;
        if !self.state.execs.lock().await.contains_key(exec) {
            return Err(Error::not_found(format!("exec {}", exec)));
        }
        if self.state.fail_resize.load(Ordering::SeqCst) {
            return Err(Error::engine_unavailable("mock resize failure"));
        }
        self.state.resizes.lock().await.push((exec.clone(), rows, cols));
        Ok(())
    }

    async fn exec_exit_code(&self, exec: &ExecId) -> Result<Option<i64>> {
        self.maybe_stall("exec_exit_code").await;
        self.check_available()?;
        let code = self
            .state
            .execs
            .lock()
            .await
            .get(exec)
            .map(|e| e.exit_code.clone())
            .ok_or_else(|| Error::not_found(format!("exec {}", exec)))?;
        let code = *code.lock().await;
        Ok(code)
    }
}

/// Send the output of a finished command, record its exit code, then
/// close the stream.
async fn write_outcome(
    mut server: DuplexStream,
    outcome: Outcome,
    tty: bool,
    exit_code: Arc<Mutex<Option<i64>>>,
) {
    let chunks = [
        (StreamKind::Stdout, outcome.stdout),
        (StreamKind::Stderr, outcome.stderr),
    ];
    for (kind, data) in chunks {
        let wire = if tty {
            Ok(bytes::Bytes::from(data))
        } else {
            encode_frame(kind, &data)
        };
        let Ok(wire) = wire else { break };
        if server.write_all(&wire).await.is_err() {
            break;
        }
    }
    *exit_code.lock().await = Some(outcome.code);
    let _ = server.shutdown().await;
}

/// Echo `input` back until EOF, `exit [N]`, or the container stopping.
async fn echo_shell(
    server: DuplexStream,
    exit_code: Arc<Mutex<Option<i64>>>,
    kill: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(server);
    let mut line = Vec::new();
    let mut buf = [0u8; 1024];

    let code = loop {
        let n = tokio::select! {
            _ = kill.cancelled() => break KILLED_EXIT_CODE,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break 0,
                Ok(n) => n,
            },
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break 0;
        }

        line.extend_from_slice(&buf[..n]);
        let mut exit = None;
        while let Some(pos) = line.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let command: Vec<u8> = line.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&command);
            let command = command.trim();
            if command == "exit" {
                exit = Some(0);
            } else if let Some(rest) = command.strip_prefix("exit ") {
                exit = Some(rest.trim().parse().unwrap_or(2));
            }
        }
        if let Some(code) = exit {
            break code;
        }
    };

    *exit_code.lock().await = Some(code);
    let _ = writer.shutdown().await;
}

/// Result of one interpreted command.
#[derive(Debug, Default)]
struct Outcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i64,
}

impl Outcome {
    fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    fn exit(code: i64) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    fn fail(code: i64, stderr: impl Into<String>) -> Self {
        let mut stderr = stderr.into();
        stderr.push('\n');
        Self {
            stderr: stderr.into_bytes(),
            code,
            ..Default::default()
        }
    }
}

/// A container's view of its bind-mounted working directory.
struct MockFs {
    host_mount: PathBuf,
    workdir: String,
}

impl MockFs {
    /// Map an in-container path onto the host mount. Paths outside the
    /// working directory (or climbing out of it) have no mapping.
    fn host_path(&self, path: &str) -> Option<PathBuf> {
        let rel = if path == self.workdir {
            ""
        } else if let Some(rest) = path.strip_prefix(&format!("{}/", self.workdir)) {
            rest
        } else if path.starts_with('/') {
            return None;
        } else {
            path
        };
        if rel.split('/').any(|part| part == "..") {
            return None;
        }
        Some(self.host_mount.join(rel.trim_start_matches("./")))
    }

    async fn run(&self, argv: &[String]) -> Outcome {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["echo", words @ ..] => Outcome::ok(format!("{}\n", words.join(" "))),
            ["true"] => Outcome::exit(0),
            ["false"] => Outcome::exit(1),
            ["sleep", secs] => match secs.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                    Outcome::exit(0)
                }
                _ => Outcome::fail(1, format!("sleep: invalid number '{}'", secs)),
            },
            ["cat", "--", path] => self.cat(path).await,
            ["rm", "-f", "--", path] => self.rm(path).await,
            ["mkdir", "-p", "--", path] => self.mkdir(path).await,
            ["grep", "-nF", "--", needle, path] => self.grep(needle, path).await,
            ["mv", "--", from, to] => self.mv(from, to).await,
            ["stat", "-c", format, "--", path] if *format == STAT_FORMAT => self.stat(path).await,
            ["sh", "-c", script, "sh", b64, path] if *script == WRITE_SCRIPT => {
                self.write(b64, path, false).await
            }
            ["sh", "-c", script, "sh", b64, path] if *script == APPEND_SCRIPT => {
                self.write(b64, path, true).await
            }
            ["sh", "-c", script, "sh", dir, format]
                if *script == LIST_SCRIPT && *format == STAT_FORMAT =>
            {
                self.list(dir).await
            }
            [program, ..] => Outcome::fail(127, format!("sh: {}: not found", program)),
            [] => Outcome::fail(126, "exec: no command"),
        }
    }

    async fn cat(&self, path: &str) -> Outcome {
        let Some(host) = self.host_path(path) else {
            return Outcome::fail(1, format!("cat: can't open '{}': Permission denied", path));
        };
        if host.is_dir() {
            return Outcome::fail(1, "cat: read error: Is a directory");
        }
        match tokio::fs::read(&host).await {
            Ok(content) => Outcome::ok(content),
            Err(_) => Outcome::fail(
                1,
                format!("cat: can't open '{}': No such file or directory", path),
            ),
        }
    }

    async fn rm(&self, path: &str) -> Outcome {
        let Some(host) = self.host_path(path) else {
            return Outcome::fail(1, format!("rm: can't remove '{}': Permission denied", path));
        };
        if host.is_dir() {
            return Outcome::fail(1, format!("rm: '{}' is a directory", path));
        }
        match tokio::fs::remove_file(&host).await {
            Ok(()) => Outcome::exit(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Outcome::exit(0),
            Err(e) => Outcome::fail(1, format!("rm: can't remove '{}': {}", path, e)),
        }
    }

    async fn mkdir(&self, path: &str) -> Outcome {
        let Some(host) = self.host_path(path) else {
            return Outcome::fail(
                1,
                format!("mkdir: can't create directory '{}': Permission denied", path),
            );
        };
        match tokio::fs::create_dir_all(&host).await {
            Ok(()) => Outcome::exit(0),
            Err(_) => Outcome::fail(
                1,
                format!("mkdir: can't create directory '{}': File exists", path),
            ),
        }
    }

    async fn grep(&self, needle: &str, path: &str) -> Outcome {
        let content = match self.host_path(path) {
            Some(host) => tokio::fs::read(&host).await.ok(),
            None => None,
        };
        let Some(content) = content else {
            return Outcome::fail(2, format!("grep: {}: No such file or directory", path));
        };

        let text = String::from_utf8_lossy(&content);
        let matches: String = text
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains(needle))
            .map(|(i, line)| format!("{}:{}\n", i + 1, line))
            .collect();
        if matches.is_empty() {
            Outcome::exit(1)
        } else {
            Outcome::ok(matches)
        }
    }

    async fn mv(&self, from: &str, to: &str) -> Outcome {
        let (Some(src), Some(mut dst)) = (self.host_path(from), self.host_path(to)) else {
            return Outcome::fail(1, format!("mv: can't rename '{}': Permission denied", from));
        };
        if tokio::fs::symlink_metadata(&src).await.is_err() {
            return Outcome::fail(
                1,
                format!("mv: can't rename '{}': No such file or directory", from),
            );
        }
        if dst.is_dir() {
            if let Some(name) = src.file_name() {
                dst = dst.join(name);
            }
        }
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Outcome::exit(0),
            Err(e) => Outcome::fail(1, format!("mv: can't rename '{}': {}", from, e)),
        }
    }

    async fn stat(&self, path: &str) -> Outcome {
        let meta = match self.host_path(path) {
            Some(host) => tokio::fs::symlink_metadata(&host).await.ok(),
            None => None,
        };
        match meta {
            Some(meta) => Outcome::ok(stat_line(&meta)),
            None => Outcome::fail(
                1,
                format!("stat: can't stat '{}': No such file or directory", path),
            ),
        }
    }

    async fn write(&self, b64: &str, path: &str, append: bool) -> Outcome {
        let Some(host) = self.host_path(path) else {
            return Outcome::fail(1, format!("sh: can't create {}: Permission denied", path));
        };
        let content = match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(content) => content,
            Err(_) => return Outcome::fail(1, "base64: invalid input"),
        };
        if !host.parent().map(Path::is_dir).unwrap_or(false) {
            return Outcome::fail(1, format!("sh: can't create {}: nonexistent directory", path));
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&host)
                .await?;
            file.write_all(&content).await?;
            file.flush().await
        }
        .await;

        match result {
            Ok(()) => Outcome::exit(0),
            Err(e) => Outcome::fail(1, format!("sh: can't create {}: {}", path, e)),
        }
    }

    async fn list(&self, dir: &str) -> Outcome {
        let Some(host) = self.host_path(dir).filter(|p| p.is_dir()) else {
            return Outcome::fail(
                1,
                format!("sh: cd: can't cd to {}: No such file or directory", dir),
            );
        };
        let mut reader = match tokio::fs::read_dir(&host).await {
            Ok(reader) => reader,
            Err(e) => return Outcome::fail(1, format!("sh: cd: can't cd to {}: {}", dir, e)),
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(meta) = tokio::fs::symlink_metadata(entry.path()).await {
                entries.push((name, meta));
            }
        }
        // Glob order: `*` first, then dotfiles.
        entries.sort_by(|(a, _), (b, _)| (a.starts_with('.'), a).cmp(&(b.starts_with('.'), b)));

        let mut out = Vec::new();
        for (name, meta) in entries {
            out.extend_from_slice(stat_line(&meta).as_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Outcome::ok(out)
    }
}

/// Render metadata the way `stat -c '%F\t%s\t%A'` does.
fn stat_line(meta: &std::fs::Metadata) -> String {
    let file_type = meta.file_type();
    let description = if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symbolic link"
    } else if meta.len() == 0 {
        "regular empty file"
    } else {
        "regular file"
    };
    format!("{}\t{}\t{}\n", description, meta.len(), symbolic_mode(meta))
}

fn symbolic_mode(meta: &std::fs::Metadata) -> String {
    let file_type = meta.file_type();
    let mut mode = String::with_capacity(10);
    mode.push(if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'l'
    } else {
        '-'
    });
    let bits = meta.permissions().mode();
    for shift in [6, 3, 0] {
        let triple = (bits >> shift) & 0o7;
        mode.push(if triple & 0o4 != 0 { 'r' } else { '-' });
        mode.push(if triple & 0o2 != 0 { 'w' } else { '-' });
        mode.push(if triple & 0o1 != 0 { 'x' } else { '-' });
    }
    mode
}
