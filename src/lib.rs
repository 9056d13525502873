//! clai - local next-command suggestion engine for interactive shells
//!
//! The engine observes every command the user executes, learns from that
//! history, and produces ranked next-command suggestions while the user is
//! still typing. The data plane is a single-writer crash-safe SQLite store
//! fed by a bounded batched ingestion pipeline; a ranker fuses decayed
//! frequency, recency, success ratios, tool affinity and Markov transitions
//! into one deterministic ordering; per-session state machines decide when
//! suggestions should fire and track multi-step workflows.
//!
//! Everything hangs off one [`Engine`] handle constructed by the outermost
//! caller - no global registries, no default databases.

pub mod cadence;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hook;
pub mod ingest;
pub mod lock;
pub mod logging;
pub mod maintenance;
pub mod normalize;
pub mod rank;
pub mod ring;
pub mod scope;
pub mod sessions;
pub mod stats;
pub mod store;
pub mod workflow;

pub use config::Config;
pub use engine::{Engine, SuggestResponse};
pub use error::{EngineError, Result};
pub use events::{CommandEvent, Shell};
pub use rank::{RankRequest, Source, Suggestion};
pub use workflow::{NextStepCandidate, WorkflowPattern};
