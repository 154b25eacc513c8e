use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("shared segment not found: {0}")]
    NotFound(String),

    #[error("shared segment already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt segment header: {0}")]
    CorruptHeader(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid topic {name:?}: {reason}")]
    InvalidTopic { name: String, reason: &'static str },

    #[error("payload of {len} bytes exceeds slot size {slot_size}")]
    PayloadTooLarge { len: usize, slot_size: usize },

    #[error("buffer of {len} bytes cannot hold a {needed} byte payload")]
    BufferTooSmall { len: usize, needed: usize },

    #[error("segment is mapped read-only")]
    ReadOnly,

    #[error("memory mapping failed: {0}")]
    Mmap(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
