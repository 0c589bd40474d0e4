//! `rpcie`: a symmetric RPC runtime.
//!
//! A connection starts with a JSON handshake ([`protocol::ConnectOption`])
//! negotiating a wire codec ([`codec`]), after which request/response
//! headers and bodies flow as length-delimited frames. Servers ([`server`])
//! register [`service::Service`]s built from plain async closures and
//! dispatch concurrently to them; clients ([`client`]) multiplex many
//! in-flight calls over one connection. [`discovery`] and [`registry`] add
//! a heartbeat-backed directory of servers, and [`xclient`] load-balances
//! across it.
//!
//! This crate does not initialize a `tracing` subscriber itself — that's
//! left to binaries and examples, per the usual library/application split.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::Client;
pub use error::RpcError;
pub use protocol::ConnectOption;
pub use server::Server;
pub use service::{Service, ServiceBuilder};
pub use xclient::{BroadcastOutcome, XClient};
