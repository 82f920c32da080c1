use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::os_error::OsError;
use crate::wake::WakeChannel;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXCEPT = 0b100;
    }
}

#[derive(Clone, Copy)]
struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {

    fn new() -> Self {
        let mut raw = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self { raw }
    }

    fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.raw) };
    }

    fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Idle,
    Ready(usize),
    Timeout,
    Error(OsError),
}

// One select() wait over bounded descriptor sets. The wakeup channel is
// always part of the read set, so another thread holding a wake_channel()
// clone can force a blocked select() to return with is_waked_up() set.
// Without a channel (creation failed, or none was shared in), wakes are
// unavailable and callers rely on their recurring timeout.
pub struct Select {
    read_interest: FdSet,
    write_interest: FdSet,
    except_interest: FdSet,
    read_result: FdSet,
    write_result: FdSet,
    except_result: FdSet,
    max_fd: RawFd,
    timeout: Option<Duration>,
    outcome: Outcome,
    wake: Option<Arc<WakeChannel>>,
}

impl Select {

    pub fn new() -> Self {
        let wake = match WakeChannel::new() {
            Ok(channel) => Some(Arc::new(channel)),
            Err(e) => {
                warn!("cl-socket: select has no wake channel, cancellation degrades to polling: {}", e);
                None
            }
        };
        Self::with_channel(wake)
    }

    pub fn with_channel(wake: Option<Arc<WakeChannel>>) -> Self {
        Self {
            read_interest: FdSet::new(),
            write_interest: FdSet::new(),
            except_interest: FdSet::new(),
            read_result: FdSet::new(),
            write_result: FdSet::new(),
            except_result: FdSet::new(),
            max_fd: -1,
            timeout: None,
            outcome: Outcome::Idle,
            wake,
        }
    }

    pub fn wake_channel(&self) -> Option<Arc<WakeChannel>> {
        self.wake.clone()
    }

    // Registers interest for the next call only; clear() forgets it.
    pub fn set_events(&mut self, fd: RawFd, interest: Interest) {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            error!("cl-socket: fd {} is outside the select() descriptor range", fd);
            return;
        }
        if interest.contains(Interest::READ) {
            self.read_interest.insert(fd);
        }
        if interest.contains(Interest::WRITE) {
            self.write_interest.insert(fd);
        }
        if interest.contains(Interest::EXCEPT) {
            self.except_interest.insert(fd);
        }
        self.max_fd = self.max_fd.max(fd);
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    // Resets descriptor interest, the last outcome, and any unread wakeup
    // tokens. The configured timeout is kept.
    pub fn clear(&mut self) {
        self.read_interest = FdSet::new();
        self.write_interest = FdSet::new();
        self.except_interest = FdSet::new();
        self.read_result = FdSet::new();
        self.write_result = FdSet::new();
        self.except_result = FdSet::new();
        self.max_fd = -1;
        self.outcome = Outcome::Idle;
        if let Some(wake) = &self.wake {
            wake.drain();
        }
    }

    pub fn select(&mut self) -> Result<usize, OsError> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            self.read_result = self.read_interest;
            self.write_result = self.write_interest;
            self.except_result = self.except_interest;

            let mut nfds = self.max_fd;
            if let Some(wake) = &self.wake {
                self.read_result.insert(wake.read_fd());
                nfds = nfds.max(wake.read_fd());
            }

            let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
            let tv_ptr = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tv.tv_sec = remaining.as_secs() as libc::time_t;
                    tv.tv_usec = remaining.subsec_micros() as libc::suseconds_t;
                    &mut tv as *mut libc::timeval
                }
                None => std::ptr::null_mut(),
            };

            let ready = unsafe {
                libc::select(
                    nfds + 1,
                    self.read_result.as_mut_ptr(),
                    self.write_result.as_mut_ptr(),
                    self.except_result.as_mut_ptr(),
                    tv_ptr,
                )
            };

            if ready == -1 {
                let err = OsError::last();
                if err.is_interrupted() {
                    continue;
                }
                self.outcome = Outcome::Error(err);
                return Err(err);
            }

            if ready == 0 {
                self.outcome = Outcome::Timeout;
                return Ok(0);
            }

            self.outcome = Outcome::Ready(ready as usize);
            return Ok(ready as usize);
        }
    }

    pub fn select_for(&mut self, timeout: Duration) -> Result<usize, OsError> {
        self.set_timeout(Some(timeout));
        self.select()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, Outcome::Timeout)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn is_waked_up(&self) -> bool {
        match (&self.outcome, &self.wake) {
            (Outcome::Ready(_), Some(wake)) => self.read_result.contains(wake.read_fd()),
            _ => false,
        }
    }

    pub fn is_read_event(&self, fd: RawFd) -> bool {
        matches!(self.outcome, Outcome::Ready(_)) && self.read_result.contains(fd)
    }

    pub fn is_write_event(&self, fd: RawFd) -> bool {
        matches!(self.outcome, Outcome::Ready(_)) && self.write_result.contains(fd)
    }

    pub fn is_exception_event(&self, fd: RawFd) -> bool {
        matches!(self.outcome, Outcome::Ready(_)) && self.except_result.contains(fd)
    }
}

impl Default for Select {
    fn default() -> Self {
        Self::new()
    }
}
