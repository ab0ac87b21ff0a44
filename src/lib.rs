//! Rusty Chat - A lightweight multi-client TCP chat server implemented in Rust
//!
//! This library provides readiness multiplexing over epoll/kqueue, a
//! length-prefixed wire protocol, and a server that relays messages
//! between connected clients by broadcast or by display name.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod mplex;
pub mod net;
pub mod protocol;
pub mod signals;

// Re-export main components
pub use config::*;
pub use constants::*;
pub use crate::core::{Acceptor, Broadcaster, BroadcasterHandle, ClientId, Server};
pub use error::{ChatError, Result};
pub use mplex::{Channel, FdInfo, IoMultiplexor, MplexFlags, Multiplexor};
pub use protocol::{read_message, write_message, Message};
