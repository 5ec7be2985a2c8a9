//! prm-github
//!
//! Read-only GitHub-compatible API client: token auth, conditional requests,
//! rate-limit header capture, and page-wise enumeration. This crate owns the
//! wire protocol only; what the pages *mean* is the discovery layer's
//! business.

mod client;
mod error;
mod paginate;

pub use client::{ApiResponse, GithubClient, RateHeaders, RateLimitOverview, ResourceLimit};
pub use error::GithubError;
pub use paginate::Paginator;
