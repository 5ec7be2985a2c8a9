//! prm-schemas
//!
//! Shared data model for the PR discovery engine: transient discovery
//! projections, change events, stored-state snapshots, the error taxonomy,
//! and the strategy traits every collaborator implements.
//!
//! This crate owns **types only**. No I/O, no persistence, no HTTP.

pub mod config;
pub mod error;
pub mod model;
pub mod strategy;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryErrorKind};
pub use model::{
    ChangeKind, CheckConclusion, CheckStatus, DiscoveredCheckRun, DiscoveredPr, DiscoveryResult,
    EntityKind, Priority, PrState, RepoStatus, RepositoryRecord, RepositoryState, StateChange,
    StoredPrState, SyncResult, TriggerEvent,
};
pub use strategy::{
    CacheStats, CacheStrategy, CheckBatchOutcome, CheckDiscovery, DataSynchronization,
    EventPublisher, PrDiscovery, RateLimitStrategy, RepositoryDirectory, ResourceStatus,
    StateDetection,
};
