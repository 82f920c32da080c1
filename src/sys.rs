use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[cfg(not(target_os = "linux"))]
use std::os::fd::AsRawFd;

use crate::os_error::OsError;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
pub(crate) fn create_socket(family: libc::c_int) -> Result<OwnedFd, OsError> {
    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
        0
    )).map_err(OsError::from)?;

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn create_socket(family: libc::c_int) -> Result<OwnedFd, OsError> {
    let fd = syscall!(socket(family, libc::SOCK_STREAM, 0)).map_err(OsError::from)?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let flags = syscall!(fcntl(fd.as_raw_fd(), libc::F_GETFD)).map_err(OsError::from)?;
    syscall!(fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC))
        .map_err(OsError::from)?;

    // No MSG_NOSIGNAL here; suppress SIGPIPE on the descriptor instead
    #[cfg(target_os = "macos")]
    {
        let on: libc::c_int = 1;
        syscall!(setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t
        )).map_err(OsError::from)?;
    }

    Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), OsError> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL)).map_err(OsError::from)?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map_err(OsError::from)?;
    Ok(())
}

// A zero-length send doubles as the connect-confirmation probe: it succeeds
// only on a socket whose connection has actually been established.
pub(crate) fn send(fd: RawFd, data: &[u8]) -> Result<usize, OsError> {
    let sent = syscall!(send(
        fd,
        data.as_ptr() as *const libc::c_void,
        data.len(),
        SEND_FLAGS
    )).map_err(OsError::from)?;

    Ok(sent as usize)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, OsError> {
    let received = syscall!(recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0
    )).map_err(OsError::from)?;

    Ok(received as usize)
}
