//! Proxima - rule-driven CONNECT proxy
//!
//! Upstream selection is written as a rule program rather than code.
//!
//! ## Features
//!
//! - Embedded rule engine with lazy, backtracking candidate generation
//! - Native capabilities for rules: `host_port/3`, `uri_template/3`, `probe/4`, `log/3`
//! - Per-request policy overrides carried in `Proxy-Authorization`
//! - Ordered fallback over upstream CONNECT proxies with a byte-for-byte relay

pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use engine::{Engine, EngineBuilder, EngineError};
pub use error::{ProximaError, Result};
