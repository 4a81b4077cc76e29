use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt handshake: {0}")]
    CorruptHandshake(String),

    #[error("corrupt framing: {0}")]
    CorruptFraming(String),

    #[error("truncated chunk: received {received} of {expected} bytes")]
    TruncatedChunk { expected: usize, received: usize },

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the peer violated the wire protocol, as opposed to a local failure
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Error::Io(_))
    }
}

/// Map an `UnexpectedEof` from `read_exact` into a protocol error, keeping
/// every other I/O failure as-is.
pub(crate) fn on_short_read(e: io::Error, corrupt: impl FnOnce() -> Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt()
    } else {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
