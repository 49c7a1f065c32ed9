//! # Shelf Core
//!
//! Shared, I/O-free logic for Shelf: wire models, the cache and session
//! store abstractions (with in-memory implementations), the metrics
//! registry, PII redaction, query understanding, the policy engine,
//! provider selection, reciprocal-rank fusion, output guards, and the
//! reindex job state machine.
//!
//! This crate contains no tokio, sqlx, reqwest, or other runtime-bound
//! dependencies. Everything here is deterministic given its inputs, which
//! is what makes the service crate's decision points testable against
//! literal snapshots.

pub mod cache;
pub mod fusion;
pub mod guard;
pub mod intent;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod policy;
pub mod reason;
pub mod redact;
pub mod reindex;
pub mod routing;
pub mod store;
pub mod transform;
