//! OpenPhone - Run many isolated Android phones on one host
//!
//! Each phone is an emulator rendering into its own virtual X display, exported
//! over VNC and bridged to WebSocket for browser access. The
//! [`InstanceRegistry`](core::InstanceRegistry) creates, starts, stops and
//! deletes phones and forwards input and screenshot requests to them.

pub mod core;
pub mod persistence;
pub mod platform;

/// Application name constant
pub const APP_NAME: &str = "OpenPhone";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
