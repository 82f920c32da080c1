#[macro_use]
pub (crate) mod sys;

#[macro_use]
pub (crate) mod logging;

mod os_error;
mod wake;
mod address;
mod select;
mod socket;

pub use os_error::OsError;
pub use wake::{WakeChannel, WakeChannelError};
pub use address::{AddressError, SocketAddress, UNIX_PREFIX};
pub use select::{Interest, Select};
pub use socket::{SocketError, SocketState, TcpSocket};
