// Handler seams and the delivered message type.
//
// Handlers are synchronous and run on the runtime's blocking pool; with
// the default max-in-flight they run concurrently, so implementations
// must be reentrancy-safe. That is a caller obligation, not something
// enforced here.
use bytes::Bytes;
use norq_wire::{MessageFrame, MessageId};

/// What a handler returns to signal failure. Failures route the message
/// to the requeue/backoff path; they never reach the caller.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A message as delivered to handlers.
#[derive(Debug, Clone)]
pub struct Message {
    timestamp_ns: i64,
    attempts: u16,
    id: MessageId,
    body: Bytes,
}

impl Message {
    pub(crate) fn from_frame(frame: MessageFrame) -> Self {
        Self {
            timestamp_ns: frame.timestamp_ns,
            attempts: frame.attempts,
            id: frame.id,
            body: frame.body,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.body
    }

    /// Broker-side delivery attempt count, starting at 1.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Broker receive time, nanoseconds since the epoch.
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

/// Per-message callback for a subscription.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Callback for messages that exhausted `max_attempts`. Invoked at most
/// once per message id, right before the message is FIN'd away.
pub trait FailedMessageHandler: Send + Sync + 'static {
    fn failed(&self, message: &Message);
}

struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message)
    }
}

/// Wrap a closure as a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> impl MessageHandler
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

struct DataFnHandler<F>(F);

impl<F> MessageHandler for DataFnHandler<F>
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message.data())
    }
}

/// Wrap a payload-only closure as a [`MessageHandler`], for handlers that
/// do not care about delivery metadata.
pub fn data_handler_fn<F>(f: F) -> impl MessageHandler
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    DataFnHandler(f)
}

struct FailedFn<F>(F);

impl<F> FailedMessageHandler for FailedFn<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn failed(&self, message: &Message) {
        (self.0)(message)
    }
}

/// Wrap a closure as a [`FailedMessageHandler`].
pub fn failed_handler_fn<F>(f: F) -> impl FailedMessageHandler
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    FailedFn(f)
}
