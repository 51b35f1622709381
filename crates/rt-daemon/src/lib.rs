//! RTunnel Daemon
//!
//! Background service that keeps the signaling connection and manages tunnel
//! sessions for one role.

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{OrchestratorCommand, OrchestratorEvent, TunnelMode, TunnelOrchestrator};
pub use registry::SessionRegistry;
