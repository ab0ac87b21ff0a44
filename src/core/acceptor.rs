//! Connection acceptor
//! Runs an accept loop on its own thread and hands every new connection
//! to a caller-supplied handler

use log::{debug, error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::constants::MAX_CONSECUTIVE_WAIT_FAILURES;
use crate::error::{ChatError, Result};
use crate::mplex::{drain_wakeups, Channel, FdInfo, IoMultiplexor, Multiplexor};
use crate::net::resolve_peer_name;

/// Receives every accepted connection together with its numeric
/// `host:service` name.
pub trait ConnectionHandler: Send + 'static {
    fn on_connection(&mut self, stream: TcpStream, peer_name: String);
}

impl<F> ConnectionHandler for F
where
    F: FnMut(TcpStream, String) + Send + 'static,
{
    fn on_connection(&mut self, stream: TcpStream, peer_name: String) {
        self(stream, peer_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    Running,
    Stopping,
}

type WorkerResult<H> = (H, Result<()>);

pub struct Acceptor<H: ConnectionHandler> {
    listener: Arc<TcpListener>,
    stop_channel: Arc<Channel>,
    state: AcceptorState,
    handler: Option<H>,
    worker: Option<JoinHandle<WorkerResult<H>>>,
    last_result: Option<Result<()>>,
}

impl<H: ConnectionHandler> Acceptor<H> {
    /// Wrap a listening socket. The socket is switched to non-blocking mode.
    pub fn new(listener: TcpListener, handler: H) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let stop_channel = Channel::new()?;

        Ok(Self {
            listener: Arc::new(listener),
            stop_channel: Arc::new(stop_channel),
            state: AcceptorState::Idle,
            handler: Some(handler),
            worker: None,
            last_result: None,
        })
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Outcome of the last accept loop, available after `stop`
    pub fn last_result(&self) -> Option<&Result<()>> {
        self.last_result.as_ref()
    }

    /// Register the listener and stop channel and spawn the accept thread.
    pub fn start(&mut self) -> Result<()> {
        if self.state != AcceptorState::Idle {
            return Err(ChatError::InvalidState(format!(
                "acceptor cannot start while {:?}",
                self.state
            )));
        }
        let mut handler = self
            .handler
            .take()
            .ok_or_else(|| ChatError::InvalidState("acceptor has no handler".to_string()))?;

        let mut mplex = Multiplexor::new(2)?;
        if let Err(e) = mplex.add_all(&[
            FdInfo::readable(self.listener.as_raw_fd()),
            FdInfo::readable(self.stop_channel.read_fd()),
        ]) {
            self.handler = Some(handler);
            return Err(e);
        }

        // A wake-up left over from a previous run must not end this one
        drain_wakeups(self.stop_channel.read_end());

        let listener = Arc::clone(&self.listener);
        let stop_channel = Arc::clone(&self.stop_channel);
        let spawned = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                let result = accept_loop(&mut mplex, &listener, &stop_channel, &mut handler);
                (handler, result)
            });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                self.state = AcceptorState::Running;
                info!("Acceptor running on {}", self.listener.local_addr()?);
                Ok(())
            }
            Err(e) => Err(ChatError::SystemError(format!("failed to spawn acceptor: {}", e))),
        }
    }

    /// Signal the accept thread and wait for it. No-op when idle.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == AcceptorState::Idle {
            return Ok(());
        }
        self.state = AcceptorState::Stopping;

        if let Err(e) = self.stop_channel.notify() {
            error!("Failed to signal acceptor: {}", e);
        }

        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok((handler, result)) => {
                    if let Err(ref e) = result {
                        error!("Accept loop ended with error: {}", e);
                    }
                    self.handler = Some(handler);
                    self.last_result = Some(result);
                }
                Err(_) => {
                    self.state = AcceptorState::Idle;
                    return Err(ChatError::SystemError("acceptor thread panicked".to_string()));
                }
            }
        }

        self.state = AcceptorState::Idle;
        info!("Acceptor stopped");
        Ok(())
    }
}

impl<H: ConnectionHandler> Drop for Acceptor<H> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping acceptor: {}", e);
        }
    }
}

fn accept_loop<H: ConnectionHandler>(
    mplex: &mut Multiplexor,
    listener: &TcpListener,
    stop_channel: &Channel,
    handler: &mut H,
) -> Result<()> {
    let listener_fd = listener.as_raw_fd();
    let stop_fd = stop_channel.read_fd();
    let mut events = Vec::with_capacity(mplex.max_events());
    let mut failures = 0;

    loop {
        if let Err(e) = mplex.wait(None, &mut events) {
            failures += 1;
            error!("Acceptor wait failed ({} in a row): {}", failures, e);
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
                    accept_pending(listener, handler);
                }
            } else if event.fd == stop_fd {
                drain_wakeups(stop_channel.read_end());
                debug!("Acceptor received stop request");
                return Ok(());
            } else {
                return Err(unknown_descriptor(event.fd));
            }
        }
    }
}

fn unknown_descriptor(fd: RawFd) -> ChatError {
    error!("Acceptor woke for descriptor {} it never registered", fd);
    ChatError::UnknownDescriptor(fd)
}

fn accept_pending<H: ConnectionHandler>(listener: &TcpListener, handler: &mut H) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{}", ChatError::Accept(e));
                return;
            }
        };

        if let Err(e) = stream.set_nonblocking(false) {
            warn!("Unable to make accepted socket blocking: {}", e);
            continue;
        }

        match resolve_peer_name(&stream) {
            Ok(peer_name) => {
                debug!("Accepted connection from {}", peer_name);
                handler.on_connection(stream, peer_name);
            }
            Err(e) => warn!("Dropping accepted connection: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;

    #[test]
    fn test_unknown_descriptor_ends_loop() {
        let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
        let stop = Channel::new().unwrap();
        let stray = Channel::new().unwrap();

        let mut mplex = Multiplexor::new(4).unwrap();
        mplex
            .add_all(&[
                FdInfo::readable(listener.as_raw_fd()),
                FdInfo::readable(stop.read_fd()),
                FdInfo::readable(stray.read_fd()),
            ])
            .unwrap();
        stray.notify().unwrap();

        let mut handler = |_stream: TcpStream, _name: String| {};
        let result = accept_loop(&mut mplex, &listener, &stop, &mut handler);
        assert!(matches!(result, Err(ChatError::UnknownDescriptor(fd)) if fd == stray.read_fd()));
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
        let mut acceptor = Acceptor::new(listener, |_s: TcpStream, _n: String| {}).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Idle);

        acceptor.start().unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Running);
        assert!(matches!(acceptor.start(), Err(ChatError::InvalidState(_))));

        acceptor.stop().unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Idle);
        assert!(matches!(acceptor.last_result(), Some(Ok(()))));
        acceptor.stop().unwrap();
    }
}
