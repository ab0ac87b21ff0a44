use log::{error, info, warn};
use std::collections::HashMap;

use crate::core::connection::{ClientConnection, ClientId, ClientSink};
use crate::error::{ChatError, Result};
use crate::protocol::Message;

/// Who is connected, keyed by connection identity
///
/// Owned by the broadcaster worker alone; nothing else reads or mutates it.
pub struct ClientDirectory<S> {
    clients: HashMap<ClientId, ClientConnection<S>>,
}

impl<S: ClientSink> ClientDirectory<S> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a new client connection.
    ///
    /// A second registration for an id already present is refused and the
    /// first one kept. Display names are unique: a newcomer reusing a name
    /// is refused and its stream half-closed so the peer sees end-of-stream.
    pub fn register(&mut self, id: ClientId, name: String, sink: S) -> Result<()> {
        if let Some(existing) = self.clients.get(&id) {
            return Err(ChatError::InvalidState(format!(
                "client {} already registered as {}",
                id, existing.name
            )));
        }

        if self.clients.values().any(|c| c.name == name) {
            if let Err(e) = sink.shutdown_write() {
                warn!("Failed to shut down rejected client {}: {}", name, e);
            }
            return Err(ChatError::InvalidState(format!("display name {} already in use", name)));
        }

        self.clients.insert(id, ClientConnection::new(id, name, sink));
        Ok(())
    }

    /// Remove a client connection, returning it
    pub fn unregister(&mut self, id: ClientId) -> Result<ClientConnection<S>> {
        self.clients
            .remove(&id)
            .ok_or_else(|| ChatError::InvalidState(format!("client {} is not registered", id)))
    }

    /// Send a message to all connected clients except its sender.
    ///
    /// Returns the number of clients that received it. A peer whose send
    /// fails is evicted and does not stop delivery to the others.
    pub fn broadcast(&mut self, message: &Message, sender: ClientId) -> usize {
        let frame = message.encode();
        let mut success_count = 0;
        let mut failed = Vec::new();

        for (id, connection) in self.clients.iter_mut() {
            // Don't send the message back to its sender
            if *id == sender {
                continue;
            }
            match connection.send_frame(&frame) {
                Ok(()) => success_count += 1,
                Err(e) => {
                    warn!(
                        "Failed to send message to client {} ({}): {}",
                        connection.name, id, e
                    );
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.evict(id);
        }
        success_count
    }

    /// Deliver to the client registered under `name`.
    pub fn send_to(&mut self, name: &str, message: &Message) -> Result<()> {
        let (id, connection) = self
            .clients
            .iter_mut()
            .find(|(_, c)| c.name == name)
            .ok_or_else(|| ChatError::InvalidState(format!("no client named {}", name)))?;

        let sent = connection.send_frame(&message.encode());
        if sent.is_err() {
            let id = *id;
            self.evict(id);
        }
        sent
    }

    /// Drop a peer that can no longer take a whole frame. Its stream is
    /// half-closed so a partial frame is never followed by another one.
    fn evict(&mut self, id: ClientId) {
        if let Some(connection) = self.clients.remove(&id) {
            if let Err(e) = connection.shutdown() {
                warn!("Failed to shut down {} ({}): {}", connection.name, id, e);
            }
            info!("Evicted {} ({}) after a failed send", connection.name, id);
        }
    }

    pub fn name_of(&self, id: ClientId) -> Option<&str> {
        self.clients.get(&id).map(|c| c.name.as_str())
    }

    // Get current clients count
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Half-close and drop every connection.
    pub fn shutdown_all(&mut self) {
        for (_, connection) in self.clients.drain() {
            if let Err(e) = connection.shutdown() {
                error!(
                    "Failed to shutdown connection to {}: {}",
                    connection.name, e
                );
            }
            info!(
                "Closed connection to {} after {:?}",
                connection.name,
                connection.connection_duration()
            );
        }
    }
}

impl<S: ClientSink> Default for ClientDirectory<S> {
    fn default() -> Self {
        Self::new()
    }
}
