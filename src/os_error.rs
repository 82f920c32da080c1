use thiserror::Error;

// Closed mapping of the errno values a socket transport can actually meet;
// everything else is carried through as Generic with its raw code.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum OsError {

    #[error("Maximum number of file descriptors reached")]
    MaxFdReached,

    #[error("Not enough memory")]
    NotEnoughMemory,

    #[error("Insufficient permissions")]
    PermissionDenied,

    #[error("The operation is forbidden on this object")]
    OperationForbidden,

    #[error("Invalid file descriptor")]
    InvalidFd,

    #[error("Invalid pointer")]
    InvalidPointer,

    #[error("Invalid operation")]
    InvalidOperation,

    #[error("The operation was interrupted")]
    OperationInterrupted,

    #[error("The operation is in progress")]
    OperationInProgress,

    #[error("The operation is already in progress")]
    OperationAlreadyInProgress,

    #[error("The resource is temporarily unavailable")]
    ResourceUnavailable,

    #[error("Address already in use")]
    AddressInUse,

    #[error("Address not available")]
    AddressNotAvailable,

    #[error("Address family not supported")]
    AddressFamilyNotSupported,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Connection timed out")]
    ConnectionTimedOut,

    #[error("Not connected")]
    NotConnected,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("Network disconnected")]
    NetworkDisconnected,

    #[error("Peer unreachable")]
    PeerUnreachable,

    #[error("Broken pipe")]
    BrokenPipe,

    #[error("No buffer space available")]
    NoBufferSpace,

    #[error("Unknown OS error")]
    UnknownError,

    #[error("OS error {0}")]
    Generic(i32),
}

impl OsError {

    pub fn last() -> Self {
        let os_error = std::io::Error::last_os_error();
        match os_error.raw_os_error() {
            Some(code) => OsError::from(code),
            None => OsError::UnknownError,
        }
    }

    // The raw errno value, appended to user-visible error strings.
    pub fn code(&self) -> i32 {
        match self {
            OsError::MaxFdReached => libc::EMFILE,
            OsError::NotEnoughMemory => libc::ENOMEM,
            OsError::PermissionDenied => libc::EPERM,
            OsError::OperationForbidden => libc::EACCES,
            OsError::InvalidFd => libc::EBADF,
            OsError::InvalidPointer => libc::EFAULT,
            OsError::InvalidOperation => libc::EINVAL,
            OsError::OperationInterrupted => libc::EINTR,
            OsError::OperationInProgress => libc::EINPROGRESS,
            OsError::OperationAlreadyInProgress => libc::EALREADY,
            OsError::ResourceUnavailable => libc::EAGAIN,
            OsError::AddressInUse => libc::EADDRINUSE,
            OsError::AddressNotAvailable => libc::EADDRNOTAVAIL,
            OsError::AddressFamilyNotSupported => libc::EAFNOSUPPORT,
            OsError::ConnectionRefused => libc::ECONNREFUSED,
            OsError::ConnectionReset => libc::ECONNRESET,
            OsError::ConnectionAborted => libc::ECONNABORTED,
            OsError::ConnectionTimedOut => libc::ETIMEDOUT,
            OsError::NotConnected => libc::ENOTCONN,
            OsError::NetworkUnreachable => libc::ENETUNREACH,
            OsError::NetworkDisconnected => libc::ENETDOWN,
            OsError::PeerUnreachable => libc::EHOSTUNREACH,
            OsError::BrokenPipe => libc::EPIPE,
            OsError::NoBufferSpace => libc::ENOBUFS,
            OsError::UnknownError => -1,
            OsError::Generic(code) => *code,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, OsError::ResourceUnavailable)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, OsError::OperationInterrupted)
    }
}

impl From<std::io::Error> for OsError {
    fn from(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(code) => Self::from(code),
            None => OsError::UnknownError,
        }
    }
}

impl From<i32> for OsError {
    fn from(os_error: i32) -> Self {
        match os_error {
            libc::EMFILE | libc::ENFILE => OsError::MaxFdReached,
            libc::ENOMEM => OsError::NotEnoughMemory,
            libc::EPERM => OsError::PermissionDenied,
            libc::EACCES => OsError::OperationForbidden,
            libc::EBADF => OsError::InvalidFd,
            libc::EFAULT => OsError::InvalidPointer,
            libc::EINVAL => OsError::InvalidOperation,
            libc::EINTR => OsError::OperationInterrupted,
            libc::EINPROGRESS => OsError::OperationInProgress,
            libc::EALREADY => OsError::OperationAlreadyInProgress,
            libc::EAGAIN => OsError::ResourceUnavailable,
            libc::EADDRINUSE => OsError::AddressInUse,
            libc::EADDRNOTAVAIL => OsError::AddressNotAvailable,
            libc::EAFNOSUPPORT => OsError::AddressFamilyNotSupported,
            libc::ECONNREFUSED => OsError::ConnectionRefused,
            libc::ECONNRESET => OsError::ConnectionReset,
            libc::ECONNABORTED => OsError::ConnectionAborted,
            libc::ETIMEDOUT => OsError::ConnectionTimedOut,
            libc::ENOTCONN => OsError::NotConnected,
            libc::ENETUNREACH => OsError::NetworkUnreachable,
            libc::ENETDOWN => OsError::NetworkDisconnected,
            libc::EHOSTUNREACH => OsError::PeerUnreachable,
            libc::EPIPE => OsError::BrokenPipe,
            libc::ENOBUFS => OsError::NoBufferSpace,
            _ => OsError::Generic(os_error),
        }
    }
}
