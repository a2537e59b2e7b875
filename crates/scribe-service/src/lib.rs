//! Scribe service: watches files, runs matching rules and serves health.

pub mod bus;
pub mod engine;
pub mod health;
pub mod pipeline;
pub mod queue;
pub mod telemetry;
pub mod watcher;
pub mod worker;

pub use engine::Engine;
