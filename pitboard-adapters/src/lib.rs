//! Telemetry sample sources for Pitboard

pub mod demo;

pub use demo::DemoSource;
