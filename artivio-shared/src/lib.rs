//! Shared models, push-event payloads, and configuration for the Artivio
//! chat platform.

pub mod config;
pub mod models;
