//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Serving the proxy protocol on an inherited socket
//! - Inspecting images through a spawned proxy
//! - Copying images into an OCI layout through a spawned proxy

pub mod commands;
pub mod handlers;

pub use handlers::{handle_copy, handle_inspect, handle_proxy};
