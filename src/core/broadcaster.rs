//! Message routing module
//! Owns the client directory on a dedicated worker thread and applies
//! routing events in the order they were enqueued

use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::core::connection::{ClientId, ClientSink};
use crate::core::directory::ClientDirectory;
use crate::error::{ChatError, Result};
use crate::protocol::Message;

/// Work item for the routing worker
pub enum RoutingEvent<S> {
    AddClient { id: ClientId, name: String, sink: S },
    DelClient { id: ClientId },
    Broadcast { from: ClientId, message: Message },
    DirectMsg { from: ClientId, message: Message },
}

impl<S> RoutingEvent<S> {
    fn kind(&self) -> &'static str {
        match self {
            RoutingEvent::AddClient { .. } => "ADD_CLIENT",
            RoutingEvent::DelClient { .. } => "DEL_CLIENT",
            RoutingEvent::Broadcast { .. } => "BROADCAST",
            RoutingEvent::DirectMsg { .. } => "DIRECT_MSG",
        }
    }
}

struct EventQueue<S> {
    events: VecDeque<RoutingEvent<S>>,
    processing: bool,
}

struct Shared<S> {
    queue: Mutex<EventQueue<S>>,
    ready: Condvar,
}

/// Producer side of the broadcaster, cheap to clone
pub struct BroadcasterHandle<S: ClientSink = TcpStream> {
    shared: Arc<Shared<S>>,
}

impl<S: ClientSink> Clone for BroadcasterHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ClientSink> BroadcasterHandle<S> {
    /// Enqueue an event and wake the worker.
    pub fn add_event(&self, event: RoutingEvent<S>) -> Result<()> {
        let mut queue = self.shared.queue.lock()?;
        if !queue.processing {
            return Err(ChatError::InvalidState(format!(
                "broadcaster stopped, {} refused",
                event.kind()
            )));
        }
        trace!("Queued {} ({} pending)", event.kind(), queue.events.len() + 1);
        queue.events.push_back(event);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    pub fn add_client(&self, id: ClientId, name: String, sink: S) -> Result<()> {
        self.add_event(RoutingEvent::AddClient { id, name, sink })
    }

    pub fn del_client(&self, id: ClientId) -> Result<()> {
        self.add_event(RoutingEvent::DelClient { id })
    }

    pub fn broadcast(&self, from: ClientId, message: Message) -> Result<()> {
        self.add_event(RoutingEvent::Broadcast { from, message })
    }

    pub fn direct_msg(&self, from: ClientId, message: Message) -> Result<()> {
        self.add_event(RoutingEvent::DirectMsg { from, message })
    }
}

/// Single-owner router for connected clients
///
/// Every write to a client, and every change to who is connected, happens
/// on the worker thread. Producers only enqueue through a
/// [`BroadcasterHandle`].
pub struct Broadcaster<S: ClientSink = TcpStream> {
    handle: BroadcasterHandle<S>,
    worker: Option<JoinHandle<()>>,
}

impl<S: ClientSink> Broadcaster<S> {
    /// Spawn the routing worker.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(EventQueue {
                events: VecDeque::new(),
                processing: true,
            }),
            ready: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("broadcaster".to_string())
            .spawn(move || run_worker(worker_shared))
            .map_err(|e| ChatError::SystemError(format!("failed to spawn broadcaster: {}", e)))?;

        Ok(Self {
            handle: BroadcasterHandle { shared },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> BroadcasterHandle<S> {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the worker and close every client.
    ///
    /// Events still queued are discarded. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        match self.handle.shared.queue.lock() {
            Ok(mut queue) => queue.processing = false,
            Err(poisoned) => poisoned.into_inner().processing = false,
        }
        self.handle.shared.ready.notify_all();

        if worker.thread().id() == thread::current().id() {
            error!("Broadcaster stop requested from its own worker; not joining");
            return;
        }

        if worker.join().is_err() {
            error!("Broadcaster worker panicked");
        }
        info!("Broadcaster stopped");
    }
}

impl<S: ClientSink> Drop for Broadcaster<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<S: ClientSink>(shared: Arc<Shared<S>>) {
    let mut directory = ClientDirectory::new();
    debug!("Broadcaster worker started");

    loop {
        let event = {
            let guard = match shared.queue.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    error!("Broadcaster queue lock poisoned: {}", e);
                    break;
                }
            };
            let mut queue = match shared
                .ready
                .wait_while(guard, |q| q.processing && q.events.is_empty())
            {
                Ok(queue) => queue,
                Err(e) => {
                    error!("Broadcaster queue lock poisoned: {}", e);
                    break;
                }
            };

            if !queue.processing {
                discard_pending(&mut queue.events);
                break;
            }
            match queue.events.pop_front() {
                Some(event) => event,
                None => continue,
            }
        };

        handle_event(&mut directory, event);
    }

    directory.shutdown_all();
    debug!("Broadcaster worker exiting");
}

fn discard_pending<S: ClientSink>(events: &mut VecDeque<RoutingEvent<S>>) {
    if !events.is_empty() {
        warn!("Discarding {} unprocessed routing events", events.len());
    }
    for event in events.drain(..) {
        if let RoutingEvent::AddClient { name, sink, .. } = event {
            if let Err(e) = sink.shutdown_write() {
                warn!("Failed to shut down undelivered client {}: {}", name, e);
            }
        }
    }
}

fn handle_event<S: ClientSink>(directory: &mut ClientDirectory<S>, event: RoutingEvent<S>) {
    match event {
        RoutingEvent::AddClient { id, name, sink } => {
            match directory.register(id, name.clone(), sink) {
                Ok(()) => info!(
                    "Client {} joined as {} ({} connected)",
                    id,
                    name,
                    directory.client_count()
                ),
                Err(e) => error!("Rejected client {} ({}): {}", id, name, e),
            }
        }
        RoutingEvent::DelClient { id } => match directory.unregister(id) {
            Ok(connection) => info!(
                "Client {} ({}) left after {:?}",
                id,
                connection.name,
                connection.connection_duration()
            ),
            Err(e) => error!("Cannot remove client: {}", e),
        },
        RoutingEvent::Broadcast { from, .. } | RoutingEvent::DirectMsg { from, .. }
            if directory.name_of(from).is_none() =>
        {
            warn!("Dropped message from unregistered client {}", from);
        }
        RoutingEvent::Broadcast { from, message } => {
            let delivered = directory.broadcast(&message, from);
            debug!(
                "Broadcast of {} bytes from {} delivered to {} clients",
                message.payload().len(),
                from,
                delivered
            );
        }
        RoutingEvent::DirectMsg { from, message } => {
            let target = message.target().unwrap_or_default().to_string();
            match directory.send_to(&target, &message) {
                Ok(()) => debug!("Direct message from {} delivered to {}", from, target),
                Err(e) => warn!("Dropped direct message from {} to {}: {}", from, target, e),
            }
        }
    }
}
