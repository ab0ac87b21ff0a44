use log::{error, trace};
use std::io::{Error, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{timeout_millis, FdInfo, IoMultiplexor, MplexFlags};
use crate::error::{ChatError, Result};

/// epoll backed readiness list
///
/// Registrations are level-triggered. Peer hang-up (`EPOLLRDHUP`) is always
/// requested so that a half-closed peer surfaces as `EOF`.
#[derive(Debug)]
pub struct EpollMultiplexor {
    epfd: OwnedFd,
    max_events: usize,
    raw: Vec<libc::epoll_event>,
    ready: usize,
}

impl EpollMultiplexor {
    pub fn new(max_events: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            let err = Error::last_os_error();
            error!("Unable to create epoll instance: {}", err);
            return Err(ChatError::MultiplexorCreate(err));
        }
        // SAFETY: epoll_create1 returned a fresh descriptor that nothing else owns.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            epfd,
            max_events,
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
            ready: 0,
        })
    }

    fn ctl(&self, op: libc::c_int, info: &FdInfo) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(info),
            u64: info.fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, info.fd, &mut ev) };
        if rc < 0 {
            let err = Error::last_os_error();
            if op == libc::EPOLL_CTL_MOD && err.raw_os_error() == Some(libc::ENOENT) {
                return Err(ChatError::NotRegistered(info.fd));
            }
            return Err(ChatError::Registration {
                fd: info.fd,
                source: err,
            });
        }
        Ok(())
    }
}

impl IoMultiplexor for EpollMultiplexor {
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<FdInfo>) -> Result<usize> {
        events.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.raw.as_mut_ptr(),
                self.raw.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                trace!("epoll_wait interrupted");
                self.ready = 0;
                return Ok(0);
            }
            return Err(ChatError::Wait(err));
        }

        let n = n as usize;
        events.extend(self.raw.iter().take(n).map(|ev| FdInfo {
            flags: MplexFlags::empty(),
            filters: from_epoll(ev.events),
            fd: ev.u64 as RawFd,
        }));
        self.ready = n;
        Ok(n)
    }

    fn add(&mut self, info: FdInfo) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, &info)
    }

    /// Each registration is an independent `epoll_ctl`. Every entry is
    /// attempted; the last failure is returned, earlier successes stay.
    fn add_all(&mut self, infos: &[FdInfo]) -> Result<()> {
        let mut outcome = Ok(());
        for info in infos {
            if let Err(e) = self.add(*info) {
                error!("Unable to add descriptor {} to epoll: {}", info.fd, e);
                outcome = Err(e);
            }
        }
        outcome
    }

    fn modify(&mut self, info: FdInfo) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, &info)
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => Err(ChatError::NotRegistered(fd)),
                _ => Err(ChatError::Registration { fd, source: err }),
            };
        }
        Ok(())
    }

    fn remove_all(&mut self, fds: &[RawFd]) -> Result<()> {
        let mut outcome = Ok(());
        for &fd in fds {
            if let Err(e) = self.remove(fd) {
                outcome = Err(e);
            }
        }
        outcome
    }

    fn max_events(&self) -> usize {
        self.max_events
    }

    fn ready_count(&self) -> usize {
        self.ready
    }
}

fn to_epoll(info: &FdInfo) -> u32 {
    // EPOLLHUP and EPOLLERR are always reported by the kernel
    let mut bits = libc::EPOLLRDHUP as u32;
    if info.filters.contains(MplexFlags::IN) {
        bits |= libc::EPOLLIN as u32;
    }
    if info.filters.contains(MplexFlags::OUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    if info.flags.contains(MplexFlags::ONESHOT) {
        bits |= libc::EPOLLONESHOT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> MplexFlags {
    let mut flags = MplexFlags::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        flags |= MplexFlags::IN;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        flags |= MplexFlags::OUT;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        flags |= MplexFlags::EOF;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        flags |= MplexFlags::ERR;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_translation() {
        let info = FdInfo::readable(3).with_flags(MplexFlags::ONESHOT);
        let bits = to_epoll(&info);
        assert_ne!(bits & libc::EPOLLIN as u32, 0);
        assert_ne!(bits & libc::EPOLLONESHOT as u32, 0);
        assert_ne!(bits & libc::EPOLLRDHUP as u32, 0);
        assert_eq!(bits & libc::EPOLLOUT as u32, 0);
    }

    #[test]
    fn test_hangup_reported_as_eof() {
        let flags = from_epoll((libc::EPOLLIN | libc::EPOLLHUP) as u32);
        assert!(flags.contains(MplexFlags::IN | MplexFlags::EOF));
        assert!(!flags.contains(MplexFlags::ERR));
    }
}
