//! Supervision and resilience core for a local voice-assistant pipeline.
//!
//! The crate keeps three services alive: a local transcription server
//! (a supervised child process), a workflow-automation webhook and a
//! speech-synthesis API (outbound dependencies).
//!
//! ## Architecture
//!
//! - **Supervisor (`supervisor`)**: spawns, probes, stops and restarts one child process.
//! - **Resilience (`resilience`)**: circuit breaker and retry-with-backoff for outbound calls.
//! - **Queue (`queue`)**: durable offline queue with dead-lettering and FIFO replay.
//! - **Monitor (`monitor`)**: background loop deciding restarts and replays.
//! - **Store (`store`)**: single source of truth, publishing immutable snapshots.
//! - **Orchestrator (`orchestrator`)**: the API exposed to the UI layer.

pub mod config;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod queue;
pub mod resilience;
pub mod serde_util;
pub mod store;
pub mod structured_logger;
pub mod supervisor;
pub mod transport;

pub use config::CoreConfig;
pub use orchestrator::{CoreError, Orchestrator, OrchestratorBuilder};
pub use store::{AppSnapshot, CoreEvent, StateStore};
pub use supervisor::ServiceStatus;
