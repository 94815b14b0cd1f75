//! Readiness interface to the external poll loop.
//!
//! The transport never blocks on its own: every operation that cannot make
//! progress returns `WouldBlock` and records interest in a [`PollSet`]. The
//! driving loop blocks once on the accumulated set, then re-runs the
//! operations that asked to be woken.
//!
//! The set is one-shot. [`PollSet::block`] consumes everything accumulated
//! since the previous call, so each loop iteration re-arms its interest from
//! scratch; stale interest cannot linger across iterations.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Interest flags indicating what I/O events to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns interest in readable events.
    #[must_use]
    pub const fn readable() -> Self {
        Self::READABLE
    }

    /// Returns interest in writable events.
    #[must_use]
    pub const fn writable() -> Self {
        Self::WRITABLE
    }

    /// Returns interest in both readable and writable events.
    #[must_use]
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Combines interests.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }
}

/// A one-shot set of wait requests collected from streams before blocking.
///
/// Streams call [`fd_wait`](Self::fd_wait) or
/// [`immediate_wake`](Self::immediate_wake) from their wait methods; the
/// driving loop then calls [`block`](Self::block) exactly once and re-runs
/// whatever asked to be woken.
#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<(RawFd, Interest)>,
    immediate: bool,
}

impl PollSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `fd` becoming ready in the given direction(s).
    ///
    /// Repeated registrations for the same descriptor are merged.
    pub fn fd_wait(&mut self, fd: RawFd, interest: Interest) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(f, _)| *f == fd) {
            *existing = existing.add(interest);
        } else {
            self.entries.push((fd, interest));
        }
    }

    /// Requests that the next [`block`](Self::block) return without sleeping.
    pub fn immediate_wake(&mut self) {
        self.immediate = true;
    }

    /// Returns true if an immediate wake has been requested.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// The descriptor interest accumulated so far.
    #[must_use]
    pub fn entries(&self) -> &[(RawFd, Interest)] {
        &self.entries
    }

    /// Returns true if nothing has been armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.immediate
    }

    /// Blocks until some registered descriptor is ready, the timeout expires,
    /// or immediately if an immediate wake was requested. Clears the set.
    ///
    /// With no registered descriptors, no immediate wake, and no timeout the
    /// call would sleep forever; it returns `InvalidInput` instead so a
    /// mis-armed loop fails loudly.
    #[allow(unsafe_code)]
    pub fn block(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let immediate = std::mem::take(&mut self.immediate);
        let entries = std::mem::take(&mut self.entries);

        let timeout_ms: libc::c_int = if immediate {
            0
        } else {
            match timeout {
                Some(t) => libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX),
                None => -1,
            }
        };

        if entries.is_empty() {
            if timeout_ms < 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "blocking forever on an empty poll set",
                ));
            }
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0)));
            }
            return Ok(());
        }

        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|&(fd, interest)| {
                let mut events: libc::c_short = 0;
                if interest.is_readable() {
                    events |= libc::POLLIN;
                }
                if interest.is_writable() {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        // SAFETY: `pollfds` is an exclusively owned, correctly sized array
        // that outlives the call.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}
