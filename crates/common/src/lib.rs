//! Shared types for the clusterd workspace.
//!
//! Keep cross-crate DTOs here so the control plane, node agents, and
//! operator tooling agree on one wire vocabulary.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
