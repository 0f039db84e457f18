#![deny(unused)]
//! Core types, traits, and error definitions for CloudRepl.
//!
//! This crate provides the building blocks shared by the sandbox engine,
//! the identity store, and the WebSocket gateway.

pub mod config;
pub mod error;
pub mod policy;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
