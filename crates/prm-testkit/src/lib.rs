//! prm-testkit
//!
//! In-memory collaborators and data factories for engine scenario tests.
//! Everything here satisfies the strategy traits with no network, no store
//! and no cache backend, so a whole discovery cycle can run in-process.

mod collaborators;
mod factories;

pub use collaborators::{
    InMemoryCache, InMemoryDirectory, InMemoryStateStore, RecordingPublisher,
    RecordingSynchronizer, StaticCheckDiscovery, StaticPrDiscovery,
};
pub use factories::{discovered_check, discovered_pr, discovery_result, repository, stored_pr};
