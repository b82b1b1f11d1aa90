//! Convoy: a control plane and execution-host agent for container deployments.
//!
//! The control plane (`convoy-server`) keeps one authenticated WebSocket
//! session per host in a [`registry::ConnectionRegistry`] and dispatches
//! DEPLOY / TERMINATE commands. Each host (`convoy-agent`) keeps its session
//! alive through a [`supervisor::ReconnectSupervisor`] and runs deployments
//! through the [`executor::DeploymentExecutor`].

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod secrets;
pub mod server;
pub mod session;
pub mod supervisor;
