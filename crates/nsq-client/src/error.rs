// Error kinds shared across the client.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed frames, oversized sizes, unexpected frame types.
    #[error("protocol error: {0}")]
    Protocol(#[from] nsq_wire::Error),

    /// A structurally valid frame whose contents do not parse.
    #[error("malformed {context} payload: {detail}")]
    Integrity {
        context: &'static str,
        detail: String,
    },

    /// Socket, TLS, or compression-layer failures.
    #[error("connection error: {0}")]
    Transport(#[from] nsq_transport::Error),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by broker")]
    ClosedByPeer,

    /// The connection died with the operation still queued on it.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no frame received within {0:?} (2x heartbeat interval)")]
    HeartbeatTimeout(Duration),

    /// A fatal server-sent error frame.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker requires authentication but no auth_secret is configured")]
    AuthRequired,

    /// Invalid configuration, surfaced synchronously at construction.
    #[error("config error: {0}")]
    Config(String),

    /// The Writer has no live connection to publish on.
    #[error("no open connections")]
    NoConnections,

    /// The component's controller task is gone.
    #[error("client is closed")]
    Closed,
}

impl Error {
    pub(crate) fn integrity(context: &'static str, detail: impl Into<String>) -> Self {
        Error::Integrity {
            context,
            detail: detail.into(),
        }
    }
}
