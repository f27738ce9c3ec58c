//! The agent control plane.
//!
//! The master side is [`AgentServer`]: a gRPC service that registers
//! agents, streams commands to them, and republishes the events they
//! report onto the shared
//! [`EventStream`](foreman_events::EventStream). The remote side is
//! [`Agent`]: a long-lived client that executes the commands it receives
//! as local processes and reports their lifecycle back, reconnecting
//! forever with a fixed back-off.

use anyhow::Result;

pub mod client;
pub mod command;
pub mod metrics;
pub mod proto;
pub mod server;

pub use client::Agent;
pub use server::AgentServer;

/// JoinHandle type alias for the tokio task handle running the server.
pub type JoinHandle = tokio::task::JoinHandle<Result<(), tonic::transport::Error>>;
