//! casebridge — eventual bidirectional consistency between a local
//! mirror, an S3-compatible object store, and a case-management origin.
//!
//! The object store is the rendezvous point: the origin and the local
//! mirror each synchronize with it. This crate houses the two engines:
//!
//! - the reconciler/orchestrator pair keeping the local mirror and the
//!   object store converged (`casebridge-sync`), and
//! - the webhook router propagating origin document events into the
//!   object store (`casebridge-webhook`).

pub mod config;
pub mod content_type;
pub mod error;
pub mod manifest;
pub mod object_store;
pub mod orchestrator;
pub mod origin;
pub mod paths;
pub mod reconcile;
pub mod scanner;
pub mod sidecar;
pub mod watcher;
pub mod webhook;

pub use error::{SyncError, SyncResult};
