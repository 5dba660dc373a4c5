//! Distributed chain-execution engine.
//!
//! A submitted job is split into [`chain::Chain`]s: an input query plus a
//! pipeline of named stages. Each node runs chain-handler threads that stream
//! input records through the pipeline, resolver threads that place new
//! chains, and a TCP transport that moves chains and termination records
//! between nodes and runs collective rendezvous operations.

pub mod chain;
pub mod config;
pub mod engine;
pub mod input;
pub mod net;
pub mod runtime;
pub mod stage;
pub mod stats;
pub mod sync;
pub(crate) mod trace;
pub mod types;
pub mod value;

pub use trace::init_tracing;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
