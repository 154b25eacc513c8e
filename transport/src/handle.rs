use crate::io::{recv_all, send_all};
use crate::{Result, Role, TransportError, TransportKind, TransportOptions};
use nix::sys::socket::{shutdown, Shutdown};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use topicring::{AccessMode, Registry, Subscriber, TopicHandle};
use tracing::{debug, warn};

enum Endpoint {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    UnixListener { listener: UnixListener, path: PathBuf },
    UnixStream(UnixStream),
    Publisher(TopicHandle),
    Subscriber(Subscriber),
}

impl Endpoint {
    fn stream_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Endpoint::TcpListener(l) => Some(l.as_fd()),
            Endpoint::TcpStream(s) => Some(s.as_fd()),
            Endpoint::UnixListener { listener, .. } => Some(listener.as_fd()),
            Endpoint::UnixStream(s) => Some(s.as_fd()),
            Endpoint::Publisher(_) | Endpoint::Subscriber(_) => None,
        }
    }
}

/// One end of a TCP, unix socket or shared-memory topic channel.
///
/// A handle is owned by exactly one party and is never duplicated. Server
/// stream handles produce client handles through [`Transport::accept`].
/// [`Transport::destroy`] releases the underlying resource; dropping the
/// handle does the same.
pub struct Transport {
    kind: TransportKind,
    mode: AccessMode,
    role: Role,
    endpoint: Option<Endpoint>,
}

impl Transport {
    pub fn create(options: &TransportOptions) -> Result<Self> {
        let endpoint = match (options.kind, options.as_server) {
            (TransportKind::Tcp, true) => {
                let host = options.host.as_deref().unwrap_or("0.0.0.0");
                let addr = format!("{}:{}", host, options.port);
                let listener = TcpListener::bind((host, options.port))
                    .map_err(|source| TransportError::BindFailed { addr: addr.clone(), source })?;
                debug!(addr = %addr, "tcp transport listening");
                Endpoint::TcpListener(listener)
            }
            (TransportKind::Tcp, false) => {
                let host = options.host.as_deref().ok_or_else(|| {
                    TransportError::ConnectFailed {
                        addr: format!(":{}", options.port),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "client transport requires a host",
                        ),
                    }
                })?;
                let addr = format!("{}:{}", host, options.port);
                let stream = connect_tcp(host, options.port).map_err(|source| {
                    TransportError::ConnectFailed {
                        addr: addr.clone(),
                        source,
                    }
                })?;
                debug!(addr = %addr, "tcp transport connected");
                Endpoint::TcpStream(stream)
            }
            (TransportKind::Unix, as_server) => {
                let path = options.host.as_deref().ok_or_else(|| {
                    let source = std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "unix transport requires a socket path",
                    );
                    if as_server {
                        TransportError::BindFailed { addr: String::new(), source }
                    } else {
                        TransportError::ConnectFailed { addr: String::new(), source }
                    }
                })?;
                if as_server {
                    let _ = std::fs::remove_file(path);
                    let listener = UnixListener::bind(path).map_err(|source| {
                        TransportError::BindFailed { addr: path.to_string(), source }
                    })?;
                    debug!(socket_path = %path, "unix transport listening");
                    Endpoint::UnixListener {
                        listener,
                        path: PathBuf::from(path),
                    }
                } else {
                    let stream = UnixStream::connect(path).map_err(|source| {
                        TransportError::ConnectFailed { addr: path.to_string(), source }
                    })?;
                    Endpoint::UnixStream(stream)
                }
            }
            (TransportKind::Shm, as_server) => {
                let topic_name = options.host.as_deref().unwrap_or_default();
                let registry = Registry::open(&options.segment)?;
                let topic = registry.lookup(topic_name)?;
                debug!(
                    segment = %options.segment,
                    topic = topic_name,
                    publisher = as_server,
                    "shm transport attached"
                );
                if as_server {
                    Endpoint::Publisher(topic)
                } else {
                    Endpoint::Subscriber(topic.subscribe())
                }
            }
        };

        Ok(Transport {
            kind: options.kind,
            mode: options.mode,
            role: options.role(),
            endpoint: Some(endpoint),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_destroyed(&self) -> bool {
        self.endpoint.is_none()
    }

    fn endpoint(&self) -> Result<&Endpoint> {
        self.endpoint.as_ref().ok_or(TransportError::Destroyed)
    }

    fn endpoint_mut(&mut self) -> Result<&mut Endpoint> {
        self.endpoint.as_mut().ok_or(TransportError::Destroyed)
    }

    /// Sends the whole buffer. A count shorter than `buf.len()` means the
    /// connection faulted after a partial write. For `Shm` one call is one
    /// published message.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let role = self.role;
        match self.endpoint_mut()? {
            Endpoint::TcpStream(s) => Ok(send_all(s.as_raw_fd(), buf)?),
            Endpoint::UnixStream(s) => Ok(send_all(s.as_raw_fd(), buf)?),
            Endpoint::Publisher(topic) => {
                topic.publish(buf)?;
                Ok(buf.len())
            }
            Endpoint::Subscriber(_) => Err(TransportError::WrongRole {
                expected: Role::Server,
                op: "send",
            }),
            Endpoint::TcpListener(_) | Endpoint::UnixListener { .. } => {
                Err(TransportError::WrongRole {
                    expected: opposite(role),
                    op: "send",
                })
            }
        }
    }

    /// Fills the whole buffer. `Ok(0)` means the peer closed before any
    /// byte arrived; a count between zero and `buf.len()` is a partial
    /// record. For `Shm` this blocks until one message is available and
    /// returns its length.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let role = self.role;
        match self.endpoint_mut()? {
            Endpoint::TcpStream(s) => Ok(recv_all(s.as_raw_fd(), buf)?),
            Endpoint::UnixStream(s) => Ok(recv_all(s.as_raw_fd(), buf)?),
            Endpoint::Subscriber(subscriber) => Ok(subscriber.recv(buf)?),
            Endpoint::Publisher(_) => Err(TransportError::WrongRole {
                expected: Role::Client,
                op: "recv",
            }),
            Endpoint::TcpListener(_) | Endpoint::UnixListener { .. } => {
                Err(TransportError::WrongRole {
                    expected: opposite(role),
                    op: "recv",
                })
            }
        }
    }

    /// Accepts one inbound connection. Interrupted waits are retried, so a
    /// queued connection is never lost to signal delivery.
    pub fn accept(&self) -> Result<Transport> {
        let endpoint = match self.endpoint()? {
            Endpoint::TcpListener(listener) => {
                let (stream, peer) = retry_interrupted(|| listener.accept())?;
                stream.set_nonblocking(false)?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(?peer, error = %e, "failed to set TCP_NODELAY");
                }
                debug!(?peer, "accepted tcp connection");
                Endpoint::TcpStream(stream)
            }
            Endpoint::UnixListener { listener, .. } => {
                let (stream, _) = retry_interrupted(|| listener.accept())?;
                stream.set_nonblocking(false)?;
                debug!("accepted unix connection");
                Endpoint::UnixStream(stream)
            }
            Endpoint::TcpStream(_) | Endpoint::UnixStream(_) => {
                return Err(TransportError::WrongRole {
                    expected: Role::Server,
                    op: "accept",
                })
            }
            Endpoint::Publisher(_) | Endpoint::Subscriber(_) => {
                return Err(TransportError::UnsupportedKind {
                    kind: self.kind,
                    op: "accept",
                })
            }
        };

        Ok(Transport {
            kind: self.kind,
            mode: self.mode,
            role: Role::Client,
            endpoint: Some(endpoint),
        })
    }

    /// Releases the underlying resource. Safe to call more than once.
    pub fn destroy(&mut self) {
        let Some(endpoint) = self.endpoint.take() else {
            return;
        };
        if let Endpoint::UnixListener { path, .. } = &endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "failed to remove unix socket path");
            }
        }
        drop(endpoint);
        debug!(kind = %self.kind, role = %self.role, "transport destroyed");
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.endpoint()? {
            Endpoint::TcpListener(l) => Ok(l.local_addr()?),
            Endpoint::TcpStream(s) => Ok(s.local_addr()?),
            _ => Err(TransportError::UnsupportedKind {
                kind: self.kind,
                op: "local_addr",
            }),
        }
    }

    /// Socket descriptor of a live stream transport.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.endpoint.as_ref().and_then(Endpoint::stream_fd)
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self.endpoint()? {
            Endpoint::TcpListener(l) => l.set_nonblocking(nonblocking)?,
            Endpoint::TcpStream(s) => s.set_nonblocking(nonblocking)?,
            Endpoint::UnixListener { listener, .. } => listener.set_nonblocking(nonblocking)?,
            Endpoint::UnixStream(s) => s.set_nonblocking(nonblocking)?,
            Endpoint::Publisher(_) | Endpoint::Subscriber(_) => {
                return Err(TransportError::UnsupportedKind {
                    kind: self.kind,
                    op: "set_nonblocking",
                })
            }
        }
        Ok(())
    }

    /// A duplicate of the connection's descriptor that can shut it down
    /// from another thread, waking any pending send or recv.
    pub fn terminator(&self) -> Result<Terminator> {
        match self.endpoint()? {
            Endpoint::TcpStream(_) | Endpoint::UnixStream(_) => {}
            Endpoint::TcpListener(_) | Endpoint::UnixListener { .. } => {
                return Err(TransportError::WrongRole {
                    expected: Role::Client,
                    op: "terminator",
                })
            }
            Endpoint::Publisher(_) | Endpoint::Subscriber(_) => {
                return Err(TransportError::UnsupportedKind {
                    kind: self.kind,
                    op: "terminator",
                })
            }
        }
        let fd = self
            .as_fd()
            .ok_or(TransportError::Destroyed)?
            .try_clone_to_owned()?;
        Ok(Terminator { fd })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Shuts a stream connection down from outside the thread that owns it.
#[derive(Debug)]
pub struct Terminator {
    fd: OwnedFd,
}

impl Terminator {
    pub fn terminate(&self) -> Result<()> {
        match shutdown(self.fd.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(nix::errno::Errno::ENOTCONN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn connect_tcp(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

fn retry_interrupted<T>(mut f: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn opposite(role: Role) -> Role {
    match role {
        Role::Client => Role::Server,
        Role::Server => Role::Client,
    }
}
