//! Tandem core: agent session orchestration for editor-embedded assistants
//!
//! The orchestrator owns sessions, tools and pending patches and talks to
//! the host editor over JSON-RPC. Each agent run executes in a worker that
//! can be killed outright when the user cancels.

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod patch;
pub mod paths;
pub mod process;
pub mod provider;
pub mod rpc;
pub mod server;
pub mod session;
pub mod tools;
pub mod worker;

pub use error::{OrchestratorError, Result};
