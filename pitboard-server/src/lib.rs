//! Pitboard Server Library
//!
//! Exposes server components for integration testing.

pub mod api;
pub mod config;
pub mod instance;
pub mod manager;
pub mod relay;
pub mod state;
pub mod store;
