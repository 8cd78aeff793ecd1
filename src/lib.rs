//! Mirror synchronization engine for a cloud bookmark service.
//!
//! Pulls the remote collection hierarchy, diffs it against the previously
//! mirrored state via a persistent identity map, and applies the minimal
//! set of local create/update/move/delete operations to converge, with
//! at-most-one run in flight and tolerance for partial failure.

pub mod auth;
pub mod coordinator;
pub mod error;
pub mod local_store;
pub mod notify;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod settings;
pub mod state;
