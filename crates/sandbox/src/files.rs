//! File operations inside a sandbox.
//!
//! Every operation is a fixed argv run through the [`ExecChannel`]. Client
//! supplied values (paths, search terms, content) always travel as their
//! own argv elements; where a shell is needed the script is a constant and
//! the values arrive as positional parameters (`sh -c '<script>' sh <args>`).

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cloudrepl_core::{Error, ExecStatus, OutputSink, Result, SandboxId};

use crate::exec::{ExecChannel, ExecRequest};
use crate::sink::CaptureSink;

/// Bytes of file content carried by one write command. Base64 inflates
/// this by a third, which keeps each argv well under the kernel limit.
pub const WRITE_CHUNK_BYTES: usize = 48 * 1024;

/// `stat` format producing `<type>\t<size>\t<mode>`.
pub(crate) const STAT_FORMAT: &str = "%F\t%s\t%A";

pub(crate) const WRITE_SCRIPT: &str = r#"printf '%s' "$1" | base64 -d > "$2""#;

pub(crate) const APPEND_SCRIPT: &str = r#"printf '%s' "$1" | base64 -d >> "$2""#;

/// Emits one record per entry of `$1`: a stat line using format `$2`, then
/// the raw name terminated by NUL.
pub(crate) const LIST_SCRIPT: &str = r#"cd -- "$1" || exit 1
for f in * .[!.]* ..?*; do
  [ -e "$f" ] || [ -L "$f" ] || continue
  stat -c "$2" -- "$f" || continue
  printf '%s\0' "$f"
done"#;

/// Kind of a directory entry as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
}

impl EntryType {
    /// Map `stat`'s `%F` description. Anything that is not a directory
    /// (regular, empty, symlink, fifo) is reported as a file.
    fn from_stat(description: &str) -> Self {
        if description == "directory" {
            EntryType::Dir
        } else {
            EntryType::File
        }
    }
}

/// One entry of a listing, or the result of a stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    pub mode: String,
}

/// Parse a `<type>\t<size>\t<mode>` stat line.
fn parse_stat_line(line: &str, name: &str) -> Option<FileEntry> {
    let mut fields = line.trim_end_matches(['\n', '\r']).split('\t');
    let description = fields.next()?;
    let size = fields.next()?.trim().parse::<u64>().ok()?;
    let mode = fields.next()?;
    if fields.next().is_some() || description.is_empty() || mode.is_empty() {
        return None;
    }
    Some(FileEntry {
        name: name.to_string(),
        entry_type: EntryType::from_stat(description),
        size,
        mode: mode.to_string(),
    })
}

/// Parse the NUL-delimited output of [`LIST_SCRIPT`].
///
/// Each record is `stat line \n name`; the first newline ends the stat line
/// so names may themselves contain newlines, tabs, or spaces. Records that
/// do not parse are skipped.
pub fn parse_listing(raw: &[u8]) -> Vec<FileEntry> {
    raw.split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (header, name) = record.split_once('\n')?;
            if name.is_empty() {
                return None;
            }
            parse_stat_line(header, name)
        })
        .collect()
}

/// File operations bound to one exec channel.
#[derive(Clone)]
pub struct FileOps {
    exec: ExecChannel,
}

impl FileOps {
    pub fn new(exec: ExecChannel) -> Self {
        Self { exec }
    }

    async fn run(
        &self,
        sandbox: &SandboxId,
        argv: Vec<String>,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.exec
            .execute(sandbox, &ExecRequest::new(argv), sink, cancel)
            .await
    }

    /// Write `content` to `path`, replacing any existing file.
    ///
    /// Content is base64 encoded and sent in chunks; the first chunk
    /// truncates, later ones append. Stops at the first failing chunk.
    pub async fn write_file(
        &self,
        sandbox: &SandboxId,
        path: &str,
        content: &[u8],
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let engine = base64::engine::general_purpose::STANDARD;

        let mut chunks = content.chunks(WRITE_CHUNK_BYTES);
        let first = chunks.next().unwrap_or(&[]);
        let status = self
            .run(sandbox, shell(WRITE_SCRIPT, [engine.encode(first), path.to_string()]), sink, cancel)
            .await?;
        if !status.success() {
            return Ok(status);
        }

        for chunk in chunks {
            let status = self
                .run(sandbox, shell(APPEND_SCRIPT, [engine.encode(chunk), path.to_string()]), sink, cancel)
                .await?;
            if !status.success() {
                return Ok(status);
            }
        }

        tracing::debug!(sandbox_id = %sandbox, path = %path, bytes = content.len(), "File written");
        Ok(status)
    }

    /// Stream the content of `path` to `sink`.
    pub async fn read_file(
        &self,
        sandbox: &SandboxId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.run(sandbox, argv(["cat", "--", path]), sink, cancel).await
    }

    pub async fn remove_file(
        &self,
        sandbox: &SandboxId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.run(sandbox, argv(["rm", "-f", "--", path]), sink, cancel).await
    }

    /// `mkdir -p`: creates parents, succeeds if the directory exists.
    pub async fn create_dir(
        &self,
        sandbox: &SandboxId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.run(sandbox, argv(["mkdir", "-p", "--", path]), sink, cancel).await
    }

    /// Lines of `path` containing `term` literally, as `<line>:<text>`.
    pub async fn search_in_file(
        &self,
        sandbox: &SandboxId,
        path: &str,
        term: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.run(sandbox, argv(["grep", "-nF", "--", term, path]), sink, cancel)
            .await
    }

    /// `mv` semantics: moves into `to` when it is an existing directory.
    pub async fn rename(
        &self,
        sandbox: &SandboxId,
        from: &str,
        to: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        self.run(sandbox, argv(["mv", "--", from, to]), sink, cancel).await
    }

    /// List the entries of directory `path`.
    ///
    /// Stderr of the listing goes to `stderr`. A directory that cannot be
    /// entered is `NotFound`.
    pub async fn list_files(
        &self,
        sandbox: &SandboxId,
        path: &str,
        stderr: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileEntry>> {
        let capture = CaptureSink::new(stderr);
        let status = self
            .run(
                sandbox,
                shell(LIST_SCRIPT, [path.to_string(), STAT_FORMAT.to_string()]),
                Some(&capture),
                cancel,
            )
            .await?;
        if !status.success() {
            return Err(Error::not_found(format!("directory {}", path)));
        }
        Ok(parse_listing(&capture.into_stdout()))
    }

    /// Stat a single path. The entry's `name` is the path as given.
    pub async fn stat_file(
        &self,
        sandbox: &SandboxId,
        path: &str,
        stderr: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<FileEntry> {
        let capture = CaptureSink::new(stderr);
        let status = self
            .run(
                sandbox,
                argv(["stat", "-c", STAT_FORMAT, "--", path]),
                Some(&capture),
                cancel,
            )
            .await?;
        if !status.success() {
            return Err(Error::not_found(path.to_string()));
        }

        let raw = String::from_utf8_lossy(&capture.into_stdout()).into_owned();
        parse_stat_line(&raw, path).ok_or(Error::StatParseError(raw))
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `sh -c <script> sh <args>...`
fn shell<const N: usize>(script: &str, args: [String; N]) -> Vec<String> {
    let mut argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
    ];
    argv.extend(args);
    argv
}
