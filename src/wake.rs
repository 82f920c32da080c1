use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use thiserror::Error;

use crate::os_error::OsError;

#[derive(Debug, Error)]
pub enum WakeChannelError {
    #[error("Failed to create wake channel: {0}")]
    FailedToCreate(OsError),

    #[error("Failed to signal wake channel: {0}")]
    FailedToWake(OsError),
}

// Converts a cross-thread cancellation request into ordinary read readiness
// that folds into a select() wait. On Linux this is a single eventfd; other
// platforms fall back to a non-blocking pipe pair.
#[derive(Debug)]
pub struct WakeChannel {
    rx: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    tx: OwnedFd,
}

impl WakeChannel {

    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self, WakeChannelError> {
        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
            .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;

        Ok(Self {
            rx: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> Result<Self, WakeChannelError> {
        let mut fds: [RawFd; 2] = [-1; 2];
        syscall!(pipe(fds.as_mut_ptr()))
            .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;

        let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
            let flags = syscall!(fcntl(fd, libc::F_GETFL))
                .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;
            syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))
                .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;
            let fd_flags = syscall!(fcntl(fd, libc::F_GETFD))
                .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;
            syscall!(fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC))
                .map_err(|e| WakeChannelError::FailedToCreate(e.into()))?;
        }

        Ok(Self { rx, tx })
    }

    // The descriptor a multiplexed wait folds into its read set.
    pub fn read_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    // Callable from any thread. A pending unread token counts as success.
    pub fn wake(&self) -> Result<(), WakeChannelError> {
        let token = 1u64.to_ne_bytes();
        let result = syscall!(write(
            self.write_fd(),
            token.as_ptr() as *const libc::c_void,
            token.len()
        ));

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let os = OsError::from(e);
                if os.is_would_block() {
                    Ok(())
                } else {
                    Err(WakeChannelError::FailedToWake(os))
                }
            }
        }
    }

    // Discards every unread token so a past wake cannot satisfy a new wait.
    pub fn drain(&self) {
        let mut buffer = [0u8; 8];
        loop {
            let result = syscall!(read(
                self.rx.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len()
            ));
            if result.is_err() {
                return;
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn write_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    #[cfg(not(target_os = "linux"))]
    fn write_fd(&self) -> RawFd {
        self.tx.as_raw_fd()
    }
}
