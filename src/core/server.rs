//! Chat server service
//! Accepts clients, reads their messages and forwards them to the broadcaster

use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::ServerConfig;
use crate::constants::{
    LISTEN_BACKLOG, MAX_CONSECUTIVE_WAIT_FAILURES, READ_CHUNK_SIZE, RESERVED_MPLEX_SLOTS,
};
use crate::core::broadcaster::{Broadcaster, BroadcasterHandle};
use crate::core::connection::ClientId;
use crate::error::{ChatError, Result};
use crate::mplex::{drain_wakeups, Channel, FdInfo, IoMultiplexor, MplexFlags, Multiplexor};
use crate::net::{bind_listener, recv_available, resolve_peer_name};
use crate::protocol::{FrameBuffer, Message};

/// A bound chat server
///
/// `bind` does all the fallible setup, `start` runs the event loop on its
/// own thread and `stop` (or drop) tears everything down.
pub struct Server {
    local_addr: SocketAddr,
    stop_channel: Arc<Channel>,
    broadcaster: Broadcaster,
    event_loop: Option<EventLoop>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl Server {
    /// Bind the listening socket and prepare the event loop.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener = bind_listener(&config.address, config.port, LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let mut mplex = Multiplexor::new(config.max_connections + RESERVED_MPLEX_SLOTS)?;
        let stop_channel = Arc::new(Channel::new()?);
        mplex.add_all(&[
            FdInfo::readable(listener.as_raw_fd()),
            FdInfo::readable(stop_channel.read_fd()),
        ])?;

        let broadcaster = Broadcaster::new()?;
        info!(
            "Chat server bound to {} using {} (max {} clients)",
            local_addr,
            mplex.backend(),
            config.max_connections
        );

        let event_loop = EventLoop {
            listener,
            mplex,
            stop_channel: Arc::clone(&stop_channel),
            clients: HashMap::new(),
            router: broadcaster.handle(),
            config,
        };

        Ok(Self {
            local_addr,
            stop_channel,
            broadcaster,
            event_loop: Some(event_loop),
            worker: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the event loop thread.
    pub fn start(&mut self) -> Result<()> {
        let mut event_loop = self.event_loop.take().ok_or_else(|| {
            ChatError::InvalidState("server has already been started".to_string())
        })?;

        let worker = thread::Builder::new()
            .name("chat-server".to_string())
            .spawn(move || event_loop.run())
            .map_err(|e| ChatError::SystemError(format!("failed to spawn server loop: {}", e)))?;

        self.worker = Some(worker);
        info!("Chat server started on {}", self.local_addr);
        Ok(())
    }

    /// Stop the event loop and close every client. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        if let Some(worker) = self.worker.take() {
            if let Err(e) = self.stop_channel.notify() {
                error!("Failed to signal server loop: {}", e);
            }
            outcome = match worker.join() {
                Ok(result) => result,
                Err(_) => Err(ChatError::SystemError("server loop panicked".to_string())),
            };
            if let Err(ref e) = outcome {
                error!("Server loop ended with error: {}", e);
            }
        }

        if self.broadcaster.is_running() {
            self.broadcaster.stop();
            info!("Chat server on {} stopped", self.local_addr);
        }
        outcome
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping server: {}", e);
        }
    }
}

/// Read side of one client and the frame it is part way through
struct ClientReader {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl ClientReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(),
        }
    }

    /// Take one non-blocking read, route every message it completes and
    /// report whether the connection is still open.
    fn receive(&mut self, router: &BroadcasterHandle, id: ClientId) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = match recv_available(&self.stream, &mut chunk) {
            Ok(0) if self.frames.pending() > 0 => {
                return Err(ChatError::Framing(format!(
                    "connection closed inside a frame ({} bytes buffered)",
                    self.frames.pending()
                )))
            }
            Ok(0) => return Ok(false),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        self.frames.extend(&chunk[..n]);
        while let Some(message) = self.frames.next_message()? {
            route(router, id, message);
        }
        Ok(true)
    }
}

fn route(router: &BroadcasterHandle, from: ClientId, message: Message) {
    trace!(
        "{} sent {} bytes to {} (sent at {:?})",
        from,
        message.payload().len(),
        message.target().unwrap_or("everyone"),
        message.sent_at()
    );
    let queued = if message.is_broadcast() {
        router.broadcast(from, message)
    } else {
        router.direct_msg(from, message)
    };
    if let Err(e) = queued {
        error!("Unable to route message from {}: {}", from, e);
    }
}

/// State owned by the server thread
struct EventLoop {
    listener: TcpListener,
    mplex: Multiplexor,
    stop_channel: Arc<Channel>,
    /// Read side of every admitted client, keyed by descriptor
    clients: HashMap<RawFd, ClientReader>,
    router: BroadcasterHandle,
    config: ServerConfig,
}

impl EventLoop {
    fn run(&mut self) -> Result<()> {
        let listener_fd = self.listener.as_raw_fd();
        let stop_fd = self.stop_channel.read_fd();
        let mut events = Vec::with_capacity(self.mplex.max_events());
        let mut failures = 0;

        loop {
            if let Err(e) = self.mplex.wait(None, &mut events) {
                failures += 1;
                error!("Server wait failed ({} in a row): {}", failures, e);
                if failures >= MAX_CONSECUTIVE_WAIT_FAILURES {
                    return Err(e);
                }
                continue;
            }
            failures = 0;

            for event in &events {
                if event.fd == listener_fd {
                    if event.is_closed() {
                        warn!("Listener reported {:?}", event.filters);
                    }
                    if event.is_readable() {
                        self.accept_pending();
                    }
                } else if event.fd == stop_fd {
                    drain_wakeups(self.stop_channel.read_end());
                    debug!("Server loop received stop request");
                    return Ok(());
                } else if self.clients.contains_key(&event.fd) {
                    self.service_client(event);
                } else {
                    error!("Server woke for descriptor {} it never registered", event.fd);
                    return Err(ChatError::UnknownDescriptor(event.fd));
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => self.admit(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}", ChatError::Accept(e));
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream) {
        if self.clients.len() >= self.config.max_connections {
            warn!(
                "Refusing connection: {} clients already connected",
                self.clients.len()
            );
            return;
        }

        let peer_name = match self.prepare(&stream) {
            Ok(name) => name,
            Err(e) => {
                warn!("Dropping accepted connection: {}", e);
                return;
            }
        };

        let sink = match stream.try_clone() {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Unable to duplicate socket for {}: {}", peer_name, e);
                return;
            }
        };

        let fd = stream.as_raw_fd();
        if let Err(e) = self
            .mplex
            .add(FdInfo::new(fd, MplexFlags::IN | MplexFlags::EOF))
        {
            warn!("Unable to watch {}: {}", peer_name, e);
            return;
        }
        self.clients.insert(fd, ClientReader::new(stream));

        debug!("Admitted {} as {}", peer_name, ClientId(fd));
        if let Err(e) = self.router.add_client(ClientId(fd), peer_name, sink) {
            error!("Unable to announce {}: {}", ClientId(fd), e);
            self.disconnect(fd);
        }
    }

    /// Blocking mode with a send timeout, then the peer's numeric name
    fn prepare(&self, stream: &TcpStream) -> Result<String> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(self.config.client_io_timeout))?;
        resolve_peer_name(stream)
    }

    fn service_client(&mut self, event: &FdInfo) {
        let fd = event.fd;

        if !event.is_readable() {
            if event.is_closed() {
                debug!("{} hung up", ClientId(fd));
                self.disconnect(fd);
            }
            return;
        }

        let outcome = match self.clients.get_mut(&fd) {
            Some(client) => client.receive(&self.router, ClientId(fd)),
            None => return,
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                debug!("{} closed its connection", ClientId(fd));
                self.disconnect(fd);
            }
            Err(e) => {
                warn!("Dropping {}: {}", ClientId(fd), e);
                self.disconnect(fd);
            }
        }
    }

    /// Deregister, announce the departure, then close the read side.
    fn disconnect(&mut self, fd: RawFd) {
        if let Err(e) = self.mplex.remove(fd) {
            warn!("Unable to stop watching {}: {}", ClientId(fd), e);
        }
        if let Err(e) = self.router.del_client(ClientId(fd)) {
            error!("Unable to announce departure of {}: {}", ClientId(fd), e);
        }
        // Descriptor closes here, after DEL_CLIENT is queued
        self.clients.remove(&fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejects_invalid_config() {
        let config = ServerConfig::new("not-an-ip", 0);
        assert!(matches!(Server::bind(config), Err(ChatError::ConfigError(_))));
    }

    #[test]
    fn test_start_twice_and_stop_twice() {
        let mut server = Server::bind(ServerConfig::new("127.0.0.1", 0)).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ChatError::InvalidState(_))));

        server.stop().unwrap();
        assert!(!server.is_running());
        server.stop().unwrap();
    }
}
