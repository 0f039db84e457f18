#![deny(unused)]
//! User record storage for CloudRepl.
//!
//! The sandbox engine only needs to know whether an owner exists before it
//! provisions a container; this crate provides the in-memory implementation
//! of that lookup.

pub mod identity;

pub use identity::InMemoryIdentityStore;
