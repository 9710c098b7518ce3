//! # Configuration Modules
//!
//! Serde settings shared by the engine and the server binary.

/// Feed, queue, tracker, HTTP and live-notify settings.
pub mod settings;
