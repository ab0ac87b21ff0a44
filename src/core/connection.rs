//! Client connection management
//! Handles the write side of a connected chat client

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::protocol::write_frame;

/// Identity of a live connection: the descriptor number the server reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub RawFd);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// A stream the broadcaster can write frames to and half-close
pub trait ClientSink: Write + Send + 'static {
    fn shutdown_write(&self) -> io::Result<()>;
}

impl ClientSink for TcpStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl ClientSink for UnixStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Represents the write side of a single client connection
pub struct ClientConnection<S> {
    pub id: ClientId,
    pub name: String,
    sink: S,
    pub connected_at: Instant,
}

impl<S: ClientSink> ClientConnection<S> {
    pub fn new(id: ClientId, name: String, sink: S) -> Self {
        Self {
            id,
            name,
            sink,
            connected_at: Instant::now(),
        }
    }

    /// Send an encoded frame through this connection
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.sink, frame)
    }

    /// Orderly half-close; the descriptor itself closes on drop
    pub fn shutdown(&self) -> io::Result<()> {
        self.sink.shutdown_write()
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl<S> fmt::Debug for ClientConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
