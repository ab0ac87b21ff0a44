use log::{error, trace};
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{FdInfo, IoMultiplexor, MplexFlags};
use crate::error::{ChatError, Result};

/// kqueue backed edge-notification queue
///
/// kqueue tracks one filter per (descriptor, direction) pair, so the
/// registered interest is remembered here to delete exactly what was added.
/// Events for the same descriptor within one wait are merged into a single
/// [`FdInfo`], matching what epoll reports.
#[derive(Debug)]
pub struct KqueueMultiplexor {
    kq: OwnedFd,
    max_events: usize,
    raw: Vec<libc::kevent>,
    registered: HashMap<RawFd, FdInfo>,
    ready: usize,
}

// SAFETY: the only non-Send parts are the `udata` pointers inside the
// kevent buffers, which are never set and never dereferenced.
unsafe impl Send for KqueueMultiplexor {}

impl KqueueMultiplexor {
    pub fn new(max_events: usize) -> Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            let err = Error::last_os_error();
            error!("Unable to create kqueue: {}", err);
            return Err(ChatError::MultiplexorCreate(err));
        }
        // SAFETY: kqueue returned a fresh descriptor that nothing else owns.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };

        Ok(Self {
            kq,
            max_events,
            raw: (0..max_events).map(|_| empty_kevent()).collect(),
            registered: HashMap::new(),
            ready: 0,
        })
    }

    /// Submit a changelist in a single `kevent` call.
    fn submit(&self, changes: &[libc::kevent]) -> std::io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl IoMultiplexor for KqueueMultiplexor {
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<FdInfo>) -> Result<usize> {
        events.clear();

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.raw.as_mut_ptr(),
                self.raw.len() as _,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                trace!("kevent interrupted");
                self.ready = 0;
                return Ok(0);
            }
            return Err(ChatError::Wait(err));
        }

        for ev in self.raw.iter().take(n as usize) {
            let fd = ev.ident as RawFd;
            let observed = from_kevent(ev);
            match events.iter_mut().find(|e| e.fd == fd) {
                Some(existing) => existing.filters |= observed,
                None => events.push(FdInfo {
                    flags: MplexFlags::empty(),
                    filters: observed,
                    fd,
                }),
            }
        }

        self.ready = events.len();
        Ok(self.ready)
    }

    fn add(&mut self, info: FdInfo) -> Result<()> {
        self.add_all(std::slice::from_ref(&info))
    }

    /// The whole batch goes to the kernel in one `kevent` call and either
    /// lands or fails together.
    fn add_all(&mut self, infos: &[FdInfo]) -> Result<()> {
        let changes: Vec<libc::kevent> = infos
            .iter()
            .flat_map(|info| changes_for(info, libc::EV_ADD | libc::EV_ENABLE))
            .collect();

        if let Err(err) = self.submit(&changes) {
            let fd = infos.first().map_or(-1, |info| info.fd);
            error!("Unable to add {} descriptor(s) to kqueue: {}", infos.len(), err);
            return Err(ChatError::Registration { fd, source: err });
        }

        for info in infos {
            self.registered.insert(info.fd, *info);
        }
        Ok(())
    }

    fn modify(&mut self, info: FdInfo) -> Result<()> {
        let previous = match self.registered.get(&info.fd) {
            Some(previous) => *previous,
            None => return Err(ChatError::NotRegistered(info.fd)),
        };

        // Drop directions no longer wanted, then (re)add the requested ones.
        let dropped = FdInfo {
            filters: previous.filters & !info.filters,
            ..previous
        };
        for change in changes_for(&dropped, libc::EV_DELETE) {
            // A fired one-shot filter is already gone from the kernel.
            if let Err(err) = self.submit(std::slice::from_ref(&change)) {
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(ChatError::Registration {
                        fd: info.fd,
                        source: err,
                    });
                }
            }
        }

        let changes = changes_for(&info, libc::EV_ADD | libc::EV_ENABLE);
        self.submit(&changes).map_err(|source| ChatError::Registration {
            fd: info.fd,
            source,
        })?;
        self.registered.insert(info.fd, info);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let info = self
            .registered
            .remove(&fd)
            .ok_or(ChatError::NotRegistered(fd))?;

        for change in changes_for(&info, libc::EV_DELETE) {
            if let Err(err) = self.submit(std::slice::from_ref(&change)) {
                match err.raw_os_error() {
                    // Fired one-shot filters and closed descriptors are
                    // already gone from the kernel queue.
                    Some(libc::ENOENT) | Some(libc::EBADF) => {}
                    _ => return Err(ChatError::Registration { fd, source: err }),
                }
            }
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

fn empty_kevent() -> libc::kevent {
    // SAFETY: kevent is a plain C struct for which all-zero is a valid value.
    unsafe { std::mem::zeroed() }
}

fn changes_for(info: &FdInfo, action: u16) -> Vec<libc::kevent> {
    let mut flags = action;
    if action & libc::EV_ADD != 0 && info.flags.contains(MplexFlags::ONESHOT) {
        flags |= libc::EV_ONESHOT;
    }

    let mut changes = Vec::with_capacity(2);
    for (wanted, filter) in [
        (MplexFlags::IN, libc::EVFILT_READ),
        (MplexFlags::OUT, libc::EVFILT_WRITE),
    ] {
        if info.filters.contains(wanted) {
            let mut ev = empty_kevent();
            ev.ident = info.fd as _;
            ev.filter = filter;
            ev.flags = flags as _;
            changes.push(ev);
        }
    }
    changes
}

fn from_kevent(ev: &libc::kevent) -> MplexFlags {
    let mut flags = MplexFlags::empty();
    if ev.flags as u16 & libc::EV_ERROR != 0 {
        flags |= MplexFlags::ERR;
        return flags;
    }
    if ev.filter == libc::EVFILT_READ {
        flags |= MplexFlags::IN;
    } else if ev.filter == libc::EVFILT_WRITE {
        flags |= MplexFlags::OUT;
    }
    if ev.flags as u16 & libc::EV_EOF != 0 {
        flags |= MplexFlags::EOF;
        if ev.fflags != 0 {
            flags |= MplexFlags::ERR;
        }
    }
    flags
}
