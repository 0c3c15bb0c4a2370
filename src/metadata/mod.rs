//! # Metadata Store Client
//!
//! The cluster's single source of truth is a linearizable hierarchical
//! key-value tree with change watches and session-scoped ephemeral nodes.
//! This module defines the client trait consumed by every other component,
//! the store path layout, and an in-process reference implementation used by
//! tests and single-host deployments.

pub mod memory;
pub mod paths;
pub mod store;

pub use memory::MemoryStore;
pub use paths::ClusterPaths;
pub use store::{
    ChangeKind, CreateMode, MetadataStore, SessionEvent, SessionId, StoreError, StoreResult,
    SubtreeWatch, VersionedRecord, WatchEvent, WatchToken, WriteExpectation,
};
