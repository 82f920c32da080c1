use std::fmt;

use thiserror::Error;

// Host names carrying this literal prefix select a Unix-domain socket whose
// path is the remainder of the string. Local driver processes rely on the
// exact prefix to reach a local server through the same API used for
// network connections.
pub const UNIX_PREFIX: &str = "localhost:";

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid host name: {0}")]
    InvalidHostName(String),

    #[error("Failed to resolve {hostname}: {message} (code {code})")]
    ResolutionFailure {
        hostname: String,
        message: String,
        code: i32,
    },

    #[error("No usable address records for {0}")]
    NoAddressFound(String),

    #[error("Unix socket path is empty")]
    EmptyUnixPath,

    #[error("Unix socket path too long ({0} bytes)")]
    UnixPathTooLong(usize),
}

// A resolved platform address: AF_INET from a blocking name lookup, or
// AF_UNIX from the prefix convention above. Construction fails instead of
// producing an unusable address, so a value of this type is always valid.
#[derive(Clone, Copy)]
pub struct SocketAddress {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SocketAddress {

    pub fn is_unix(host_name: &str) -> bool {
        host_name.starts_with(UNIX_PREFIX)
    }

    pub fn new(host_name: &str, port: u16) -> Result<Self, AddressError> {
        if Self::is_unix(host_name) {
            Self::af_unix(&host_name[UNIX_PREFIX.len()..])
        } else {
            Self::af_inet(host_name, port)
        }
    }

    pub fn family(&self) -> libc::c_int {
        self.storage.ss_family as libc::c_int
    }

    pub fn is_unix_domain(&self) -> bool {
        self.family() == libc::AF_UNIX
    }

    // Pointer and length for connect(); valid for as long as self lives.
    pub fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        (&self.storage as *const libc::sockaddr_storage as *const libc::sockaddr, self.len)
    }

    fn af_inet(host_name: &str, port: u16) -> Result<Self, AddressError> {
        let c_hostname = std::ffi::CString::new(host_name)
            .map_err(|_| AddressError::InvalidHostName(host_name.to_string()))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut result_ptr: *mut libc::addrinfo = std::ptr::null_mut();

        let ret = unsafe {
            libc::getaddrinfo(
                c_hostname.as_ptr(),
                std::ptr::null(),
                &hints,
                &mut result_ptr
            )
        };

        if ret != 0 {
            let msg = unsafe {
                std::ffi::CStr::from_ptr(libc::gai_strerror(ret))
            }.to_string_lossy().into_owned();

            if !result_ptr.is_null() {
                unsafe { libc::freeaddrinfo(result_ptr) };
            }

            return Err(AddressError::ResolutionFailure {
                hostname: host_name.to_string(),
                message: msg,
                code: ret,
            });
        }

        let mut found = None;
        let mut current_addrinfo = result_ptr;

        while !current_addrinfo.is_null() {
            let addrinfo = unsafe { &*current_addrinfo };

            if addrinfo.ai_family == libc::AF_INET && !addrinfo.ai_addr.is_null() {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                let len = addrinfo.ai_addrlen.min(
                    std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t
                );

                unsafe {
                    std::ptr::copy_nonoverlapping(
                        addrinfo.ai_addr as *const u8,
                        &mut storage as *mut libc::sockaddr_storage as *mut u8,
                        len as usize,
                    );
                }

                // The service argument is left null above; fold the port in
                // here, in network byte order.
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe { (*sin).sin_port = port.to_be() };

                found = Some(Self { storage, len });
                break;
            }

            current_addrinfo = addrinfo.ai_next;
        }

        if !result_ptr.is_null() {
            unsafe { libc::freeaddrinfo(result_ptr) };
        }

        found.ok_or_else(|| AddressError::NoAddressFound(host_name.to_string()))
    }

    #[cfg(target_os = "linux")]
    fn af_unix(path: &str) -> Result<Self, AddressError> {
        // Abstract namespace: a leading NUL in sun_path, no filesystem entry.
        let bytes = path.as_bytes();
        if bytes.is_empty() {
            return Err(AddressError::EmptyUnixPath);
        }

        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        if bytes.len() + 1 > sun.sun_path.len() {
            return Err(AddressError::UnixPathTooLong(bytes.len()));
        }

        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in bytes.iter().enumerate() {
            sun.sun_path[i + 1] = *b as libc::c_char;
        }

        let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + 1 + bytes.len();
        Ok(Self::from_unix(sun, len as libc::socklen_t))
    }

    #[cfg(not(target_os = "linux"))]
    fn af_unix(path: &str) -> Result<Self, AddressError> {
        // Filesystem namespace, NUL-terminated path.
        let bytes = path.as_bytes();
        if bytes.is_empty() {
            return Err(AddressError::EmptyUnixPath);
        }

        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        if bytes.len() + 1 > sun.sun_path.len() {
            return Err(AddressError::UnixPathTooLong(bytes.len()));
        }

        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in bytes.iter().enumerate() {
            sun.sun_path[i] = *b as libc::c_char;
        }

        let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
        Ok(Self::from_unix(sun, len as libc::socklen_t))
    }

    fn from_unix(sun: libc::sockaddr_un, len: libc::socklen_t) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        unsafe {
            std::ptr::copy_nonoverlapping(
                &sun as *const libc::sockaddr_un as *const u8,
                &mut storage as *mut libc::sockaddr_storage as *mut u8,
                std::mem::size_of::<libc::sockaddr_un>()
                    .min(std::mem::size_of::<libc::sockaddr_storage>()),
            );
        }

        Self { storage, len }
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAddress")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}
