use topicring::{AccessMode, DEFAULT_SEGMENT_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Unix,
    Shm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Parameters for [`Transport::create`](crate::Transport::create).
///
/// `host` is the peer or bind address for `Tcp`, the socket path for `Unix`
/// and the topic name for `Shm`. `mode` is recorded on the handle as a hint
/// and never changes framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub kind: TransportKind,
    pub host: Option<String>,
    pub port: u16,
    /// Reserved.
    pub flags: u32,
    pub mode: AccessMode,
    pub as_server: bool,
    pub segment: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            kind: TransportKind::Tcp,
            host: None,
            port: 0,
            flags: 0,
            mode: AccessMode::SingleWriter,
            as_server: false,
            segment: DEFAULT_SEGMENT_NAME.to_string(),
        }
    }
}

impl TransportOptions {
    pub fn tcp_server(host: Option<&str>, port: u16) -> Self {
        TransportOptions {
            host: host.map(str::to_string),
            port,
            as_server: true,
            ..Default::default()
        }
    }

    pub fn tcp_client(host: &str, port: u16) -> Self {
        TransportOptions {
            host: Some(host.to_string()),
            port,
            ..Default::default()
        }
    }

    pub fn unix_server(path: &str) -> Self {
        TransportOptions {
            kind: TransportKind::Unix,
            host: Some(path.to_string()),
            as_server: true,
            ..Default::default()
        }
    }

    pub fn unix_client(path: &str) -> Self {
        TransportOptions {
            kind: TransportKind::Unix,
            host: Some(path.to_string()),
            ..Default::default()
        }
    }

    /// Publisher on `topic` in the default segment.
    pub fn shm_publisher(topic: &str) -> Self {
        TransportOptions {
            kind: TransportKind::Shm,
            host: Some(topic.to_string()),
            as_server: true,
            ..Default::default()
        }
    }

    /// Subscriber on `topic`, starting at the current head.
    pub fn shm_subscriber(topic: &str) -> Self {
        TransportOptions {
            kind: TransportKind::Shm,
            host: Some(topic.to_string()),
            ..Default::default()
        }
    }

    pub fn with_segment(mut self, segment: &str) -> Self {
        self.segment = segment.to_string();
        self
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn role(&self) -> Role {
        if self.as_server {
            Role::Server
        } else {
            Role::Client
        }
    }
}
