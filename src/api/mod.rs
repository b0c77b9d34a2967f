//! HTTP API Module
//!
//! Provides a REST API for writes and replica-set administration.

mod http;

pub use http::{AppState, HttpServer};
