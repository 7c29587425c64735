//! Apphost - a private multi-tenant app hosting platform
//!
//! This library hosts user-submitted apps behind a single public port:
//! - Accepts a code file plus a dependency manifest per app
//! - Provisions an isolated execution environment and installs dependencies
//! - Launches each app as a supervised OS process on a pooled internal port
//! - Persists per-app metadata for crash recovery
//! - Routes inbound traffic (including WebSocket upgrades) to the right
//!   backend by inspecting the request path

/// Package name, for startup banners
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version, for startup banners
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod api;
pub mod config;
pub mod error;
pub mod logs;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod supervisor;
