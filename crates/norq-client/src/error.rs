// Error taxonomy for the client surface.
//
// Discovery (lookup) failures never appear here: they are logged and
// counted by the subscriber, which keeps polling regardless.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Caller-supplied input rejected before any network IO.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// TCP or handshake IO failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed frame or a reply the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The broker answered a PUB/MPUB with an error frame.
    #[error("broker rejected publish: {0}")]
    Publish(String),

    /// MPUB failed while the publisher is in atomic mode. No per-message
    /// fallback was attempted.
    #[error("Atomic batch publishing failed for {batch_size} messages: {cause}")]
    AtomicBatchPublishFailed {
        batch_size: usize,
        #[source]
        cause: Box<Error>,
    },

    /// The balance strategy has no configured broker nodes.
    #[error("no broker nodes configured")]
    NoNodesAvailable,

    /// The connection (or component) is already closed.
    #[error("closed: {0}")]
    Closed(&'static str),
}

impl From<norq_wire::Error> for Error {
    fn from(err: norq_wire::Error) -> Self {
        match err {
            norq_wire::Error::InvalidName(_) => {
                Error::InvalidArgument("invalid topic or channel name")
            }
            other => Error::Protocol(other.to_string()),
        }
    }
}
