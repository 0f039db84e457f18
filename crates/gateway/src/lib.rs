#![deny(unused)]
//! WebSocket gateway for CloudRepl.
//!
//! This crate is the network entry point: it accepts client connections on
//! `/ws`, decodes JSON session messages and routes them to the sandbox
//! manager, wrapping every byte of output in an `output` frame.

pub mod dispatcher;
pub mod messages;
pub mod server;
pub mod sink;

pub use dispatcher::Dispatcher;
pub use messages::{InboundMessage, MessageKind};
pub use server::{AppState, GatewayConfig, GatewayServer};
pub use sink::{output_frame, WsOutputSink};
