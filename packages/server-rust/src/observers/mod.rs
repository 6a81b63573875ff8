//! Built-in observers and the default inbox/outbox pipeline layouts.

pub mod inbox;
pub mod outbox;

use uuid::Uuid;

pub use inbox::{
    inbox_pipeline, DeferralObserver, ExpiryObserver, HandleMessageObserver, RetryObserver,
    UninvokedObserver,
};
pub use outbox::{outbox_pipeline, DispatchObserver};

pub const READ_STAGE: &str = "read";
pub const HANDLE_STAGE: &str = "handle";
pub const ACKNOWLEDGE_STAGE: &str = "acknowledge";
pub const DISPATCH_STAGE: &str = "dispatch";

/// Faults raised by the built-in observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("no handler registered for message type '{message_type}'")]
    MissingHandler { message_type: String },
    #[error("message '{message_id}' has no recipient uri")]
    MissingRecipient { message_id: Uuid },
}
