//! `RelayBus` Core: transport envelopes, queue contracts, and route specifications.

pub mod clock;
pub mod error;
pub mod message;
pub mod queue;
pub mod serializer;
pub mod specification;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::{ConfigurationError, QueueError};
pub use message::{MessageType, TransportMessage};
pub use queue::{AcknowledgementToken, Queue, QueueFactory, QueueResolver, QueueUri, ReceivedMessage};
pub use serializer::SerializationError;
pub use specification::{Specification, SpecificationFactory};
