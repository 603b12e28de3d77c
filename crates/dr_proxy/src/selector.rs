use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task_pool::TaskPool;

pub const DEFAULT_EVENT_SIZE: usize = 1024;

/// Readiness interest for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn epoll_bits(self) -> u32 {
        match self {
            Self::Read => libc::EPOLLIN as u32,
            Self::Write => libc::EPOLLOUT as u32,
            Self::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

pub type Handler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Read/write handlers for one descriptor, looked up from the side table
/// after each readiness batch.
#[derive(Clone)]
pub struct FdHandlers {
    pub read: Option<Handler>,
    pub write: Option<Handler>,
}

impl FdHandlers {
    pub fn read_only(handler: Handler) -> Self {
        Self {
            read: Some(handler),
            write: None,
        }
    }

    pub fn write_only(handler: Handler) -> Self {
        Self {
            read: None,
            write: Some(handler),
        }
    }
}

/// Edge-triggered epoll wrapper.
///
/// Handlers run on the owned task pool, never on the poller thread. A
/// handler that does not drain its descriptor fully will stall until the
/// next edge, so consumers loop local reads to exhaustion before returning.
pub struct Selector {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    event_size: usize,
    handlers: DashMap<RawFd, FdHandlers>,
    task_pool: Arc<TaskPool>,
}

impl Selector {
    pub fn new(event_size: usize, task_pool: Arc<TaskPool>) -> io::Result<Self> {
        let event_size = if event_size == 0 {
            DEFAULT_EVENT_SIZE
        } else {
            event_size
        };

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        // The wake descriptor is level-triggered and never drained: once
        // written, every poller blocked in epoll_wait returns and observes
        // cancellation.
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            event_size,
            handlers: DashMap::new(),
            task_pool,
        })
    }

    /// Register a descriptor. Fails if it is already registered.
    pub fn register(&self, fd: RawFd, interest: Interest, handlers: FdHandlers) -> io::Result<()> {
        match self.handlers.entry(fd) {
            Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} is already registered"),
            )),
            Entry::Vacant(vacant) => {
                let mut event = libc::epoll_event {
                    events: interest.epoll_bits() | libc::EPOLLET as u32,
                    u64: fd as u64,
                };
                if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) }
                    < 0
                {
                    return Err(io::Error::last_os_error());
                }
                vacant.insert(handlers);
                Ok(())
            }
        }
    }

    /// Change interest and handlers of a registered descriptor. Fails if it
    /// is not registered.
    pub fn modify(&self, fd: RawFd, interest: Interest, handlers: FdHandlers) -> io::Result<()> {
        let Some(mut entry) = self.handlers.get_mut(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("fd {fd} is not registered"),
            ));
        };

        let mut event = libc::epoll_event {
            events: interest.epoll_bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        *entry = handlers;
        Ok(())
    }

    /// Remove a descriptor. Fails if it is not registered; callers racing
    /// with concurrent teardown must tolerate `NotFound`.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        if self.handlers.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("fd {fd} is not registered"),
            ));
        }

        if unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } < 0
        {
            let err = io::Error::last_os_error();
            // A closed descriptor has already left the epoll set.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Blocking poll loop. Returns `Ok` on cancellation; an unrecoverable
    /// `epoll_wait` failure is fatal and propagates.
    pub fn poll(&self, cancel: &CancellationToken) -> io::Result<()> {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.event_size];

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let ready = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    -1,
                )
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter().take(ready as usize) {
                let fd = event.u64 as RawFd;
                if fd == self.wake_fd {
                    continue;
                }

                // Clone handlers out before dispatch so the shard lock is
                // not held while submit blocks; a missing entry is a
                // concurrent unregister and is skipped.
                let Some((read, write)) = self
                    .handlers
                    .get(&fd)
                    .map(|entry| (entry.read.clone(), entry.write.clone()))
                else {
                    debug!(fd, "readiness for unregistered fd, skipping");
                    continue;
                };

                let readable = event.events
                    & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32
                    != 0;
                let writable = event.events & libc::EPOLLOUT as u32 != 0;

                if readable {
                    if let Some(handler) = read {
                        self.task_pool.submit(Box::new(move || handler()));
                    }
                }
                if writable {
                    if let Some(handler) = write {
                        self.task_pool.submit(Box::new(move || handler()));
                    }
                }
            }
        }
    }

    /// Unblock every poller currently inside `epoll_wait`.
    pub fn wake(&self) {
        let one: u64 = 1;
        let written = unsafe {
            libc::write(
                self.wake_fd,
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            debug!("selector wake write failed: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
