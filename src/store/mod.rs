//! Central state store and event bus.
//!
//! - `snapshot`: immutable [`AppSnapshot`] values handed to consumers
//! - `events`: discrete [`CoreEvent`] notifications
//! - `state_store`: the serialized writer that publishes both

pub mod events;
pub mod snapshot;
pub mod state_store;

pub use events::CoreEvent;
pub use snapshot::{AppSnapshot, DependencyView, ProcessView};
pub use state_store::StateStore;
