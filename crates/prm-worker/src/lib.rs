//! prm-worker
//!
//! The long-lived PR monitor process: configuration, dependency wiring,
//! the scheduled discovery loop, signal handling and the HTTP status
//! surface.

pub mod probes;
pub mod routes;
pub mod supervisor;
