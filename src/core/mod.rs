//! Core functionality for the chat server

pub mod acceptor;
pub mod broadcaster;
pub mod connection;
pub mod directory;
pub mod server;

// Re-export main components for convenience
pub use acceptor::{Acceptor, AcceptorState, ConnectionHandler};
pub use broadcaster::{Broadcaster, BroadcasterHandle, RoutingEvent};
pub use connection::{ClientConnection, ClientId, ClientSink};
pub use directory::ClientDirectory;
pub use server::Server;
