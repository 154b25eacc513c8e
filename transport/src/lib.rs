use std::fmt;
use thiserror::Error;
use topicring::RegistryError;

pub mod acceptor;
pub mod cancel;
pub mod group;
pub mod handle;
pub(crate) mod io;
pub mod options;
pub mod server;
pub mod unit;

pub use acceptor::Acceptor;
pub use cancel::CancellationToken;
pub use group::UnitGroup;
pub use handle::{Terminator, Transport};
pub use options::{Role, TransportKind, TransportOptions};
pub use server::{EchoServer, ServerConfig, ServerStats};
pub use unit::{CloseReason, EchoUnit, UnitReport, UnitState};

pub use topicring::AccessMode;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} is not supported on {kind} transports")]
    UnsupportedKind { kind: TransportKind, op: &'static str },
    #[error("{op} requires a {expected} transport")]
    WrongRole { expected: Role, op: &'static str },
    #[error("transport already destroyed")]
    Destroyed,
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
            TransportKind::Shm => "shm",
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}
