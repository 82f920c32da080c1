use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::address::SocketAddress;
use crate::os_error::OsError;
use crate::select::{Interest, Select};
use crate::sys;
use crate::wake::WakeChannel;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// Upper bound on cancellation latency when the wake channel is unavailable.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

const RECV_BUFFER_SIZE: usize = 64 * 1024;
const DROP_DISCONNECT_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Bound,
    Listening,
    Closing,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("The remote host closed the connection")]
    RemoteHostClosed,

    #[error("Host not found")]
    HostNotFound,

    #[error("Socket access error")]
    SocketAccess,

    #[error("Socket resource error")]
    SocketResource,

    #[error("Socket operation timed out")]
    SocketTimeout,

    #[error("Datagram too large")]
    DatagramTooLarge,

    #[error("Network error")]
    Network,

    #[error("Address already in use")]
    AddressInUse,

    #[error("Address not available")]
    AddressNotAvailable,

    #[error("Unsupported socket operation")]
    UnsupportedSocketOperation,

    #[error("Unfinished socket operation")]
    UnfinishedSocketOperation,

    #[error("Operation not permitted in the current state")]
    Operation,

    #[error("Temporary error")]
    Temporary,

    #[error("Unknown socket error")]
    UnknownSocket,
}

type NotifyCallback = dyn Fn() + Send + Sync;
type DataCallback = dyn Fn(&[u8]) + Send + Sync;
type ErrorCallback = dyn Fn(SocketError) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connected: Option<Arc<NotifyCallback>>,
    disconnected: Option<Arc<NotifyCallback>>,
    data: Option<Arc<DataCallback>>,
    error: Option<Arc<ErrorCallback>>,
}

struct Shared {
    state: SocketState,
    last_error: Option<(SocketError, String)>,
    fd: Option<Arc<OwnedFd>>,
    worker: Option<ThreadId>,
    connect_timeout: Duration,
}

struct Inner {
    shared: Mutex<Shared>,
    state_changed: Condvar,
    cancel: AtomicBool,
    callbacks: Mutex<Callbacks>,
    wake: Option<Arc<WakeChannel>>,
}

impl Inner {

    fn state(&self) -> SocketState {
        self.shared.lock().state
    }

    fn set_state(&self, state: SocketState) {
        let mut shared = self.shared.lock();
        debug!("cl-socket: state {:?} -> {:?}", shared.state, state);
        shared.state = state;
        self.state_changed.notify_all();
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn connect_timeout(&self) -> Duration {
        self.shared.lock().connect_timeout
    }

    fn wake_select(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.wake();
        }
    }

    // Single funnel for connection failures: records the error, cancels the
    // attempt, and reports through the error callback.
    fn fail(&self, error: SocketError, context: &str, os: OsError) {
        self.fail_msg(error, format!("{}: {} (code {})", context, os, os.code()));
    }

    fn fail_msg(&self, error: SocketError, message: String) {
        error!("cl-socket: {}", message);
        {
            let mut shared = self.shared.lock();
            shared.last_error = Some((error, message));
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.invoke_error(error);
    }

    // Caller-side misuse: recorded and reported, but an in-flight
    // connection is left alone.
    fn record_error(&self, error: SocketError, message: &str) {
        warn!("cl-socket: {}", message);
        {
            let mut shared = self.shared.lock();
            shared.last_error = Some((error, message.to_string()));
        }
        self.invoke_error(error);
    }

    fn about_to_close(&self) {
        if self.cancel.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut shared = self.shared.lock();
            if shared.state != SocketState::Unconnected {
                debug!("cl-socket: state {:?} -> Closing", shared.state);
                shared.state = SocketState::Closing;
                self.state_changed.notify_all();
            }
        }
        self.wake_select();
    }

    // Callback slots are cloned out before the call so a handler may
    // re-register callbacks or request a disconnect without deadlocking.
    fn invoke_connected(&self) {
        let callback = self.callbacks.lock().connected.clone();
        if let Some(callback) = callback {
            (*callback)();
        }
    }

    fn invoke_disconnected(&self) {
        let callback = self.callbacks.lock().disconnected.clone();
        if let Some(callback) = callback {
            (*callback)();
        }
    }

    fn invoke_data(&self, data: &[u8]) {
        let callback = self.callbacks.lock().data.clone();
        if let Some(callback) = callback {
            (*callback)(data);
        }
    }

    fn invoke_error(&self, error: SocketError) {
        let callback = self.callbacks.lock().error.clone();
        if let Some(callback) = callback {
            (*callback)(error);
        }
    }
}

fn connect_error_kind(os: OsError) -> SocketError {
    match os {
        OsError::ConnectionRefused
        | OsError::ConnectionReset
        | OsError::ConnectionAborted
        | OsError::BrokenPipe => SocketError::ConnectionRefused,
        OsError::ConnectionTimedOut => SocketError::SocketTimeout,
        OsError::NetworkUnreachable
        | OsError::NetworkDisconnected
        | OsError::PeerUnreachable => SocketError::Network,
        OsError::PermissionDenied | OsError::OperationForbidden => SocketError::SocketAccess,
        _ => SocketError::UnknownSocket,
    }
}

fn worker_main(inner: Arc<Inner>, host: String, port: u16) {
    {
        let mut shared = inner.shared.lock();
        shared.worker = Some(thread::current().id());
    }

    run_connection(&inner, &host, port);

    // Teardown runs on every exit path: success-then-loss, immediate
    // failure, and cancellation.
    {
        let mut shared = inner.shared.lock();
        debug!("cl-socket: state {:?} -> Unconnected", shared.state);
        shared.state = SocketState::Unconnected;
        shared.fd = None;
        inner.state_changed.notify_all();
    }
    inner.invoke_disconnected();
}

fn run_connection(inner: &Arc<Inner>, host: &str, port: u16) {
    let endpoint = if SocketAddress::is_unix(host) {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };

    if inner.cancelled() {
        return;
    }

    let address = match SocketAddress::new(host, port) {
        Ok(address) => address,
        Err(e) => {
            return inner.fail_msg(
                SocketError::HostNotFound,
                format!("Failed to resolve {}: {}", endpoint, e),
            );
        }
    };

    let fd = match sys::create_socket(address.family()) {
        Ok(fd) => Arc::new(fd),
        Err(os) => return inner.fail(SocketError::SocketResource, "Failed to create socket", os),
    };

    if let Err(os) = sys::set_nonblocking(fd.as_raw_fd()) {
        return inner.fail(
            SocketError::UnknownSocket,
            "Failed to configure non-blocking socket",
            os,
        );
    }

    inner.shared.lock().fd = Some(Arc::clone(&fd));
    inner.set_state(SocketState::Connecting);

    let (addr_ptr, addr_len) = address.as_raw();
    if let Err(e) = syscall!(connect(fd.as_raw_fd(), addr_ptr, addr_len)) {
        let os = OsError::from(e);
        if os != OsError::OperationInProgress {
            return inner.fail(connect_error_kind(os), "Failed to connect", os);
        }
    }

    let mut select = Select::with_channel(inner.wake.clone());

    // Connect confirmation: wait for the descriptor to settle, then probe
    // with a zero-length send, which succeeds only on an established
    // connection.
    let deadline = Instant::now() + inner.connect_timeout();
    loop {
        select.clear();
        select.set_events(
            fd.as_raw_fd(),
            Interest::READ | Interest::WRITE | Interest::EXCEPT,
        );
        select.set_timeout(Some(deadline.saturating_duration_since(Instant::now())));

        // Checked after clear(): a wake raced away by the drain implies the
        // cancel flag is already visible here, and a later wake survives
        // into the select below.
        if inner.cancelled() {
            return;
        }

        if let Err(os) = select.select() {
            return inner.fail(SocketError::UnknownSocket, "Connect wait failed", os);
        }

        if inner.cancelled() {
            return;
        }

        if select.is_timeout() {
            return inner.fail_msg(
                SocketError::SocketTimeout,
                format!("Connection to {} timed out", endpoint),
            );
        }

        if select.is_read_event(fd.as_raw_fd())
            || select.is_write_event(fd.as_raw_fd())
            || select.is_exception_event(fd.as_raw_fd())
        {
            break;
        }

        // Woken without descriptor activity; re-arm with the remaining time
    }

    if let Err(os) = sys::send(fd.as_raw_fd(), &[]) {
        return inner.fail(connect_error_kind(os), "Failed to connect", os);
    }

    info!("cl-socket: connected to {}", endpoint);
    inner.set_state(SocketState::Connected);
    inner.invoke_connected();

    read_loop(inner, &fd, &mut select);
}

fn read_loop(inner: &Arc<Inner>, fd: &Arc<OwnedFd>, select: &mut Select) {
    let mut buffer = BytesMut::zeroed(RECV_BUFFER_SIZE);

    loop {
        select.clear();
        select.set_events(fd.as_raw_fd(), Interest::READ);
        select.set_timeout(Some(READ_POLL_INTERVAL));

        // Ordered after clear() so a concurrent cancellation is seen either
        // here or as an undrained wake token in the select below.
        if inner.cancelled() {
            return;
        }

        if let Err(os) = select.select() {
            return inner.fail(SocketError::UnknownSocket, "Read wait failed", os);
        }

        if inner.cancelled() {
            return;
        }

        if select.is_timeout() || select.is_waked_up() {
            continue;
        }

        if !select.is_read_event(fd.as_raw_fd()) {
            continue;
        }

        match sys::recv(fd.as_raw_fd(), &mut buffer) {
            Ok(0) => {
                return inner.fail_msg(
                    SocketError::ConnectionRefused,
                    "Connection closed by peer".to_string(),
                );
            }
            Ok(received) => inner.invoke_data(&buffer[..received]),
            Err(os) if os.is_would_block() || os.is_interrupted() => continue,
            Err(os) => {
                return inner.fail(SocketError::ConnectionRefused, "Socket read failed", os);
            }
        }
    }
}

pub struct TcpSocket {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSocket {

    pub fn new() -> Self {
        let wake = match WakeChannel::new() {
            Ok(channel) => Some(Arc::new(channel)),
            Err(e) => {
                warn!(
                    "cl-socket: no wake channel, cancellation falls back to polling: {}",
                    e
                );
                None
            }
        };

        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: SocketState::Unconnected,
                    last_error: None,
                    fd: None,
                    worker: None,
                    connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                }),
                state_changed: Condvar::new(),
                cancel: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
                wake,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.state()
    }

    pub fn error(&self) -> Option<SocketError> {
        self.inner.shared.lock().last_error.as_ref().map(|(error, _)| *error)
    }

    pub fn error_string(&self) -> Option<String> {
        self.inner.shared.lock().last_error.as_ref().map(|(_, message)| message.clone())
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.shared.lock().connect_timeout = timeout;
    }

    // Last registration wins; there is no fan-out. Callbacks run on the
    // socket's background thread.
    pub fn on_connected<F>(&self, callback: F)
    where F: Fn() + Send + Sync + 'static {
        self.inner.callbacks.lock().connected = Some(Arc::new(callback));
    }

    pub fn on_disconnected<F>(&self, callback: F)
    where F: Fn() + Send + Sync + 'static {
        self.inner.callbacks.lock().disconnected = Some(Arc::new(callback));
    }

    pub fn on_data<F>(&self, callback: F)
    where F: Fn(&[u8]) + Send + Sync + 'static {
        self.inner.callbacks.lock().data = Some(Arc::new(callback));
    }

    pub fn on_error_occurred<F>(&self, callback: F)
    where F: Fn(SocketError) + Send + Sync + 'static {
        self.inner.callbacks.lock().error = Some(Arc::new(callback));
    }

    pub fn connect_to_host(&self, host_name: &str, port: u16) -> Result<(), SocketError> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != SocketState::Unconnected {
                drop(shared);
                self.inner.record_error(
                    SocketError::Operation,
                    "connect_to_host requires an unconnected socket",
                );
                return Err(SocketError::Operation);
            }
            debug!("cl-socket: state {:?} -> HostLookup", shared.state);
            shared.state = SocketState::HostLookup;
            shared.last_error = None;
            self.inner.state_changed.notify_all();
        }

        // Serialize against the previous attempt: at most one background
        // thread per socket, ever.
        self.join_worker();
        self.inner.cancel.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let host = host_name.to_string();
        let spawned = thread::Builder::new()
            .name("cl-socket-worker".into())
            .spawn(move || worker_main(inner, host, port));

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.inner.set_state(SocketState::Unconnected);
                self.inner.record_error(
                    SocketError::SocketResource,
                    "Failed to spawn socket worker thread",
                );
                Err(SocketError::SocketResource)
            }
        }
    }

    pub fn disconnect_from_host(&self) {
        self.inner.about_to_close();
    }

    // Returns the number of bytes written: the full buffer, or 0 when the
    // socket is not connected or the send fails.
    pub fn write(&self, data: &[u8]) -> usize {
        let fd = {
            let shared = self.inner.shared.lock();
            if shared.state != SocketState::Connected {
                return 0;
            }
            match &shared.fd {
                Some(fd) => Arc::clone(fd),
                None => return 0,
            }
        };

        let mut total = 0;
        while total < data.len() {
            match sys::send(fd.as_raw_fd(), &data[total..]) {
                Ok(sent) => total += sent,
                Err(os) if os.is_would_block() || os.is_interrupted() => continue,
                Err(os) => {
                    self.inner.fail(SocketError::ConnectionRefused, "Socket write failed", os);
                    return 0;
                }
            }
        }

        total
    }

    pub fn wait_for_connected(&self, timeout: Duration) -> bool {
        self.wait_for_state(SocketState::Connected, timeout)
    }

    pub fn wait_for_disconnected(&self, timeout: Duration) -> bool {
        self.wait_for_state(SocketState::Unconnected, timeout)
    }

    fn wait_for_state(&self, target: SocketState, timeout: Duration) -> bool {
        let mut shared = self.inner.shared.lock();

        // Waiting from the socket's own thread would deadlock the state
        // machine; reject instead.
        if shared.worker == Some(thread::current().id()) {
            drop(shared);
            self.inner.record_error(
                SocketError::Operation,
                "wait_for_* is not callable from the socket's own thread",
            );
            return false;
        }

        let deadline = Instant::now() + timeout;
        while shared.state != target {
            if self.inner.state_changed.wait_until(&mut shared, deadline).timed_out() {
                return shared.state == target;
            }
        }
        true
    }

    fn join_worker(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.inner.cancel.store(true, Ordering::SeqCst);
            self.inner.wake_select();

            // A disconnected() handler may reconnect; the exiting worker
            // cannot join itself, so its handle is dropped instead.
            if handle.thread().id() == thread::current().id() {
                return;
            }

            let _ = handle.join();
        }
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.inner.about_to_close();
        let _ = self.wait_for_disconnected(DROP_DISCONNECT_WAIT);
        self.join_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected,
        Data(Vec<u8>),
        Disconnected,
        Error(SocketError),
    }

    fn instrument(socket: &TcpSocket) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();

        let sender = tx.clone();
        socket.on_connected(move || {
            let _ = sender.send(Event::Connected);
        });

        let sender = tx.clone();
        socket.on_disconnected(move || {
            let _ = sender.send(Event::Disconnected);
        });

        let sender = tx.clone();
        socket.on_data(move |data| {
            let _ = sender.send(Event::Data(data.to_vec()));
        });

        socket.on_error_occurred(move |error| {
            let _ = tx.send(Event::Error(error));
        });

        rx
    }

    fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    // Binding and immediately dropping a listener yields a port that is
    // free but (almost certainly) refused.
    fn refused_port() -> u16 {
        let (_, port) = local_listener();
        port
    }

    #[test]
    fn test_fresh_socket_state() {
        let socket = TcpSocket::new();
        assert_eq!(socket.state(), SocketState::Unconnected);
        assert_eq!(socket.error(), None);
        assert_eq!(socket.error_string(), None);
        assert_eq!(socket.write(b"data"), 0);
        assert_eq!(socket.error(), None);
    }

    #[test]
    fn test_callback_order_on_successful_connection() {
        let (listener, port) = local_listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"hello").unwrap();
        });

        let socket = TcpSocket::new();
        let events = instrument(&socket);

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));
        server.join().unwrap();

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::Connected
        );

        let mut received = Vec::new();
        loop {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                Event::Data(chunk) => received.extend_from_slice(&chunk),
                Event::Error(_) => {}
                Event::Disconnected => break,
                Event::Connected => panic!("connected fired twice"),
            }
        }

        assert_eq!(&received, b"hello");
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));
        assert_eq!(socket.state(), SocketState::Unconnected);
    }

    #[test]
    fn test_connection_refused() {
        let port = refused_port();

        let socket = TcpSocket::new();
        let events = instrument(&socket);

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        let mut saw_connected = false;
        let mut saw_disconnected = false;
        while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
            match event {
                Event::Connected => saw_connected = true,
                Event::Disconnected => saw_disconnected = true,
                _ => {}
            }
        }

        assert!(!saw_connected);
        assert!(saw_disconnected);
        assert_eq!(socket.state(), SocketState::Unconnected);
        assert_eq!(socket.error(), Some(SocketError::ConnectionRefused));
        assert!(socket.error_string().is_some());
    }

    #[test]
    fn test_host_lookup_failure() {
        // .invalid is reserved and never resolves (RFC 6761)
        let socket = TcpSocket::new();
        socket.connect_to_host("host.invalid", 80).unwrap();
        // Generous bound: a broken resolver can take several seconds to
        // give up on the lookup
        assert!(socket.wait_for_disconnected(Duration::from_secs(30)));
        assert_eq!(socket.error(), Some(SocketError::HostNotFound));
    }

    #[test]
    fn test_round_trip() {
        let (listener, port) = local_listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 7];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
            buf.to_vec()
        });

        let socket = TcpSocket::new();
        let (tx, rx) = mpsc::channel();
        socket.on_data(move |data| {
            let _ = tx.send(data.to_vec());
        });

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        assert_eq!(socket.write(b"abc"), 3);
        assert_eq!(socket.write(b"defg"), 4);

        let echoed = server.join().unwrap();
        assert_eq!(&echoed, b"abcdefg");

        let mut received = Vec::new();
        while received.len() < 7 {
            let chunk = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received, b"abcdefg");

        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let socket = TcpSocket::new();
        socket.disconnect_from_host();
        socket.disconnect_from_host();
        assert_eq!(socket.state(), SocketState::Unconnected);

        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
            drop(stream);
        });

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        socket.on_disconnected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        socket.disconnect_from_host();
        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));
        socket.disconnect_from_host();

        // Let any stray poll interval pass before counting
        thread::sleep(Duration::from_millis(600));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_cross_thread_cancellation_is_prompt() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
            drop(stream);
        });

        let socket = TcpSocket::new();
        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        // Let the worker settle into its read wait
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(2)));

        // Well under the recurring poll interval: the wake channel, not the
        // poll timeout, terminated the wait
        assert!(started.elapsed() < Duration::from_millis(300));

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_connect_while_connected_is_rejected() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
            drop(stream);
        });

        let socket = TcpSocket::new();
        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        assert_eq!(
            socket.connect_to_host("127.0.0.1", port),
            Err(SocketError::Operation)
        );
        assert_eq!(socket.error(), Some(SocketError::Operation));
        assert_eq!(socket.state(), SocketState::Connected);

        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_wait_from_worker_thread_is_rejected() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
            drop(stream);
        });

        let socket = Arc::new(TcpSocket::new());
        let (tx, rx) = mpsc::channel();

        let in_callback = Arc::clone(&socket);
        socket.on_connected(move || {
            let ok = in_callback.wait_for_connected(Duration::from_millis(10));
            let _ = tx.send((ok, in_callback.error()));
        });

        socket.connect_to_host("127.0.0.1", port).unwrap();

        let (ok, error) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!ok);
        assert_eq!(error, Some(SocketError::Operation));

        // Replace the slot so it no longer holds the socket itself
        socket.on_connected(|| {});

        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let mut streams = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().unwrap();
                streams.push(stream);
            }
            let _ = hold_rx.recv();
            drop(streams);
        });

        let socket = TcpSocket::new();

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));
        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));
        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_reconnect_from_disconnected_callback() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let mut streams = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().unwrap();
                streams.push(stream);
            }
            let _ = hold_rx.recv();
            drop(streams);
        });

        let socket = Arc::new(TcpSocket::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>();

        let in_callback = Arc::clone(&socket);
        let counter = Arc::clone(&attempts);
        socket.on_disconnected(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = in_callback.connect_to_host("127.0.0.1", port);
                let _ = reconnect_tx.send(());
            }
        });

        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        socket.disconnect_from_host();

        // The handler reconnects from inside the exiting worker thread
        reconnect_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));

        socket.on_disconnected(|| {});
        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_drop_while_connected() {
        let (listener, port) = local_listener();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
            drop(stream);
        });

        {
            let socket = TcpSocket::new();
            socket.connect_to_host("127.0.0.1", port).unwrap();
            assert!(socket.wait_for_connected(Duration::from_secs(5)));
            // Dropping requests the disconnect and joins the worker
        }

        let _ = hold_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_wait_for_connected_times_out_on_refused() {
        let port = refused_port();
        let socket = TcpSocket::new();
        socket.connect_to_host("127.0.0.1", port).unwrap();
        assert!(!socket.wait_for_connected(Duration::from_millis(300)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unix_domain_connection() {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener};

        // Path-shaped, but in the abstract namespace: no filesystem entry
        let name = format!("/tmp/cl-socket-test-{}.sock", std::process::id());
        let bind_addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let listener = UnixListener::bind_addr(&bind_addr).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let socket = TcpSocket::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected);
        socket.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.connect_to_host(&format!("localhost:{}", name), 0).unwrap();
        assert!(socket.wait_for_connected(Duration::from_secs(5)));
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        assert_eq!(socket.write(b"ping"), 4);
        assert_eq!(&server.join().unwrap(), b"ping");

        socket.disconnect_from_host();
        assert!(socket.wait_for_disconnected(Duration::from_secs(5)));
    }
}
