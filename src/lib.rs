#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flock Core
//!
//! Generic cluster-management core: assigns and tracks the distributed
//! state of logical resource partitions across a dynamic set of participant
//! processes, with a linearizable metadata store as the single source of
//! truth.
//!
//! ## Architecture
//!
//! Three cooperating engines close the control loop through the store:
//!
//! - The **controller pipeline** ([`controller`]) reacts to cluster-change
//!   events by re-reading cluster state, computing the best possible
//!   placement, and emitting state-transition messages.
//! - The **state-machine engine** ([`participant`]) executes constrained
//!   transitions on command, one at a time per partition replica, and
//!   reports current state back to the store.
//! - The **manager/session layer** ([`manager`]) owns connections,
//!   INIT/CALLBACK/FINALIZE listener delivery, session-expiry recovery, and
//!   leader election, so at most one controller is ever active.
//!
//! ## Module Organization
//!
//! - [`metadata`] - Store client trait, path layout, in-memory reference store
//! - [`model`] - Persisted records: ideal/current state, messages, views
//! - [`manager`] - Connection lifecycle, listeners, leadership
//! - [`participant`] - State models, factories, transition engine, consumer
//! - [`messaging`] - Store-backed message dispatch
//! - [`controller`] - Stage pipeline and the generic controller
//! - [`config`] - Operational configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flock_core::config::FlockConfig;
//! use flock_core::manager::{ClusterManager, InstanceType};
//! use flock_core::metadata::MemoryStore;
//! use flock_core::participant::{
//!     MessageConsumer, OnlineOfflineStateModelFactory, StateMachineEngine,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let manager = ClusterManager::new(
//!     "demo-cluster",
//!     "node-1",
//!     InstanceType::Participant,
//!     store.clone(),
//!     FlockConfig::default(),
//! );
//! manager.connect().await?;
//!
//! let engine = Arc::new(StateMachineEngine::new(store.clone(), "demo-cluster", "node-1"));
//! engine.register_factory(Arc::new(OnlineOfflineStateModelFactory::new()));
//! let consumer = MessageConsumer::new(engine, store, "demo-cluster", "node-1", 16);
//! manager
//!     .add_message_listener(Arc::new(consumer), "node-1")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod logging;
pub mod manager;
pub mod messaging;
pub mod metadata;
pub mod model;
pub mod participant;

pub use config::FlockConfig;
pub use error::{FlockError, Result};
pub use manager::{ClusterManager, InstanceType};
pub use metadata::{MemoryStore, MetadataStore, SessionId};
pub use model::{Message, State};
