//! skiff - workflow engine for packed CWL graphs on a container orchestrator
//!
//! A user submits a packed workflow document (one JSON bundle holding every
//! referenced process), input parameter bindings, and an identity. skiff
//! schedules the workflow's steps as a dependency-aware concurrent graph,
//! dispatches each leaf process as an isolated container job, tracks its
//! lifecycle and resource consumption, and gathers outputs back up through
//! the workflow hierarchy.
//!
//! ## Pieces
//!
//! - [`pack`]: flatten multi-file CWL into one addressable document
//! - [`workflow`]: the typed process model and structural validation
//! - [`engine`]: task tree resolution and concurrent scheduling
//! - [`jobs`]: orchestrator brokers, job specs, reaper, resource sampler
//! - [`registry`]: per-(user, run) persistence of workflow, inputs, and log
//! - [`api`]: the HTTP surface
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> skiff::Result<()> {
//! use std::sync::Arc;
//! use skiff::config::Config;
//! use skiff::engine::Engine;
//! use skiff::jobs::LocalBroker;
//! use skiff::registry::RunStore;
//!
//! let config = Arc::new(Config::load());
//! let store = RunStore::new(config.data_dir());
//! let engine = Engine::open(
//!     Arc::new(LocalBroker::new()),
//!     store,
//!     config,
//!     "alice",
//!     "run-id",
//! )
//! .await?;
//! let outputs = engine.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod pack;
pub mod registry;
pub mod shutdown;
pub mod workflow;

pub use error::{Error, Result};
