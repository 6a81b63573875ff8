//! Queue resolution and the built-in in-memory transport.

pub mod manager;
pub mod memory;

pub use manager::QueueManager;
pub use memory::{MemoryQueue, MemoryQueueFactory, MEMORY_SCHEME};
