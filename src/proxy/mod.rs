//! CONNECT proxy
//!
//! This module provides:
//! - fact extraction from inbound CONNECT requests
//! - lazy candidate generation from the rule program
//! - the outbound CONNECT handshake and the byte relay
//! - the hyper listener that ties them together

pub mod candidates;
pub mod dispatcher;
pub mod facts;
pub mod handshake;
pub mod server;
pub mod tunnel;

pub use candidates::{Candidate, CandidateIterator};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handshake::{HandshakeError, HandshakeTimeouts};
pub use server::ProxyServer;
pub use tunnel::{Relay, RelayStats};
