//! Readiness polling over the platform's native facility
//!
//! Linux uses epoll, the BSD family (macOS included) uses kqueue. Both
//! backends implement [`IoMultiplexor`] and are wrapped by the closed
//! [`Multiplexor`] enum, which is the only type the rest of the crate sees.
//!
//! A multiplexor never owns the descriptors it watches. Registration
//! methods take `&mut self`: an instance has exactly one writer at a time.

pub mod channel;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;

use bitflags::bitflags;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{ChatError, Result};

pub use channel::{drain_wakeups, Channel};

#[cfg(target_os = "linux")]
pub use epoll::EpollMultiplexor;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueMultiplexor;

bitflags! {
    /// Interest and readiness bits shared by both backends
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MplexFlags: u8 {
        const IN      = 0x01;
        const OUT     = 0x02;
        const ONESHOT = 0x04;
        const EOF     = 0x08;
        const ERR     = 0x10;
    }
}

/// A descriptor registration, or an observed readiness event
///
/// On input `filters` is the requested interest and `flags` the requested
/// behavior. On output `filters` holds what was actually observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdInfo {
    pub flags: MplexFlags,
    pub filters: MplexFlags,
    pub fd: RawFd,
}

impl FdInfo {
    pub fn new(fd: RawFd, filters: MplexFlags) -> Self {
        Self {
            flags: MplexFlags::empty(),
            filters,
            fd,
        }
    }

    /// Interest in incoming data
    pub fn readable(fd: RawFd) -> Self {
        Self::new(fd, MplexFlags::IN)
    }

    /// Interest in write space
    pub fn writable(fd: RawFd) -> Self {
        Self::new(fd, MplexFlags::OUT)
    }

    pub fn with_flags(mut self, flags: MplexFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_readable(&self) -> bool {
        self.filters.contains(MplexFlags::IN)
    }

    pub fn is_writable(&self) -> bool {
        self.filters.contains(MplexFlags::OUT)
    }

    /// Peer hang-up or descriptor error observed
    pub fn is_closed(&self) -> bool {
        self.filters.intersects(MplexFlags::EOF | MplexFlags::ERR)
    }
}

/// Operations every polling backend provides
pub trait IoMultiplexor {
    /// Block until a registered descriptor is ready or `timeout` elapses.
    ///
    /// `None` blocks indefinitely and a zero duration polls. `events` is
    /// cleared and refilled; the returned count equals its length. A
    /// timeout or an interrupted call yields `Ok(0)`.
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<FdInfo>) -> Result<usize>;

    fn add(&mut self, info: FdInfo) -> Result<()>;

    /// Register a batch. See the backend docs for atomicity.
    fn add_all(&mut self, infos: &[FdInfo]) -> Result<()>;

    /// Replace the interest of a registered descriptor, re-arming a
    /// one-shot registration.
    fn modify(&mut self, info: FdInfo) -> Result<()>;

    /// Fails with [`ChatError::NotRegistered`] for unknown descriptors.
    fn remove(&mut self, fd: RawFd) -> Result<()>;

    fn remove_all(&mut self, fds: &[RawFd]) -> Result<()>;

    fn max_events(&self) -> usize;

    /// Ready count reported by the most recent `wait`
    fn ready_count(&self) -> usize;
}

/// The backend selected for this platform
#[derive(Debug)]
pub enum Multiplexor {
    #[cfg(target_os = "linux")]
    Epoll(EpollMultiplexor),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(KqueueMultiplexor),
}

impl Multiplexor {
    /// Create the platform backend with room for `max_events` events per wait.
    pub fn new(max_events: usize) -> Result<Self> {
        if max_events == 0 {
            return Err(ChatError::ConfigError(
                "multiplexor capacity must be at least 1".to_string(),
            ));
        }

        create_backend(max_events)
    }

    /// Name of the backend, for logging
    pub fn backend(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Multiplexor::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly"
            ))]
            Multiplexor::Kqueue(_) => "kqueue",
        }
    }
}

#[cfg(target_os = "linux")]
fn create_backend(max_events: usize) -> Result<Multiplexor> {
    EpollMultiplexor::new(max_events).map(Multiplexor::Epoll)
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn create_backend(max_events: usize) -> Result<Multiplexor> {
    KqueueMultiplexor::new(max_events).map(Multiplexor::Kqueue)
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            Multiplexor::Epoll($inner) => $body,
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly"
            ))]
            Multiplexor::Kqueue($inner) => $body,
        }
    };
}

impl IoMultiplexor for Multiplexor {
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<FdInfo>) -> Result<usize> {
        dispatch!(self, m => m.wait(timeout, events))
    }

    fn add(&mut self, info: FdInfo) -> Result<()> {
        dispatch!(self, m => m.add(info))
    }

    fn add_all(&mut self, infos: &[FdInfo]) -> Result<()> {
        dispatch!(self, m => m.add_all(infos))
    }

    fn modify(&mut self, info: FdInfo) -> Result<()> {
        dispatch!(self, m => m.modify(info))
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        dispatch!(self, m => m.remove(fd))
    }

    fn remove_all(&mut self, fds: &[RawFd]) -> Result<()> {
        dispatch!(self, m => m.remove_all(fds))
    }

    fn max_events(&self) -> usize {
        dispatch!(self, m => m.max_events())
    }

    fn ready_count(&self) -> usize {
        dispatch!(self, m => m.ready_count())
    }
}

/// Convert an optional timeout to whole milliseconds, rounding sub-millisecond
/// waits up so they do not degrade into a busy poll.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_millis().max(1);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_secs(3))), 3000);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn test_fd_info_builders() {
        let info = FdInfo::readable(5).with_flags(MplexFlags::ONESHOT);
        assert!(info.is_readable());
        assert!(!info.is_writable());
        assert!(info.flags.contains(MplexFlags::ONESHOT));

        let closed = FdInfo::new(5, MplexFlags::EOF);
        assert!(closed.is_closed());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Multiplexor::new(0).is_err());
    }
}
