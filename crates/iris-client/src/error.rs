// Error taxonomy surfaced by the binding.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The relay refused the connection handshake.
    #[error("relay handshake failed: {0}")]
    Init(String),

    /// Malformed or unexpected frame. Fatal for the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A blocking operation exceeded its deadline. Recoverable.
    #[error("operation timed out")]
    Timeout,

    /// A peer handler answered a request with an error string.
    #[error("remote error: {0}")]
    Remote(String),

    /// The peer side of a tunnel, or the relay itself, closed with a
    /// failure reason.
    #[error("remote close failed: {0}")]
    RemoteClose(String),

    /// The connection has been torn down; no further operations possible.
    #[error("connection closed")]
    Closed,

    /// Validator rejection. Never touches the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<iris_wire::Error> for Error {
    fn from(err: iris_wire::Error) -> Self {
        match err {
            iris_wire::Error::Io(err) => Error::Io(err),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl Error {
    // Fatal reader errors are fanned out to every pending operation; io
    // errors are not clonable, so copy through kind + message.
    pub(crate) fn fan_out(&self) -> Error {
        match self {
            Error::Init(msg) => Error::Init(msg.clone()),
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
            Error::Timeout => Error::Timeout,
            Error::Remote(msg) => Error::Remote(msg.clone()),
            Error::RemoteClose(msg) => Error::RemoteClose(msg.clone()),
            Error::Closed => Error::Closed,
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        }
    }
}
