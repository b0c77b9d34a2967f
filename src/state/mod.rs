//! State Management Module
//!
//! Durable per-member election and replication state.

mod tracker;

pub use tracker::StateTracker;
