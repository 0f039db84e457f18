#![deny(unused)]
//! Sandbox session engine for CloudRepl.
//!
//! Every user gets one isolated container with their host directory
//! bind-mounted at the working directory. This crate provisions those
//! containers, runs commands in them, bridges interactive terminals, and
//! implements file operations as injection-safe commands.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Transport (WebSocket gateway)             │
//! │    ↓ owner id + request                    │
//! ├────────────────────────────────────────────┤
//! │  SandboxManager                            │
//! │    ↓ resolves owner → sandbox              │
//! ├──────────────┬──────────────┬──────────────┤
//! │  FileOps     │  ExecChannel │  Interactive │
//! │    ↓ argv    │  FrameCodec  │  Bridge      │
//! ├──────────────┴──────────────┴──────────────┤
//! │  SandboxEngine + SandboxRegistry           │
//! │    ↓ SandboxBackend (Docker via bollard)   │
//! ├────────────────────────────────────────────┤
//! │  Container (one per user)                  │
//! │    /work  (bind mount of host dir)         │
//! │    No network, no caps                     │
//! └────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cloudrepl_sandbox::{DockerBackend, SandboxManager};
//!
//! let backend = Arc::new(DockerBackend::connect()?);
//! let manager = SandboxManager::new(backend, identity, config.sandbox.clone());
//!
//! manager.init_project(&owner, &cancel).await?;
//! manager.write_file(&owner, "main.js", b"console.log(1)", Some(&sink), &cancel).await?;
//! ```

pub mod backend;
pub mod codec;
pub mod docker;
pub mod engine;
pub mod exec;
pub mod files;
pub mod interactive;
pub mod manager;
pub mod mock;
pub mod registry;
pub mod sink;

pub use backend::{ContainerSpec, ExecAttachment, ExecSpec, SandboxBackend};
pub use codec::{FrameCodec, StreamFrame};
pub use docker::DockerBackend;
pub use engine::{Provisioned, Sandbox, SandboxEngine, StopAllReport};
pub use exec::{ExecChannel, ExecRequest};
pub use files::{EntryType, FileEntry, FileOps};
pub use interactive::{InteractiveBridge, InteractiveHandle, SessionState};
pub use manager::SandboxManager;
pub use mock::MockBackend;
pub use registry::SandboxRegistry;
pub use sink::{BufferSink, ChannelSink};
