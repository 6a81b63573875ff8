//! In-process FIFO transport addressed as `memory://<name>`.
//!
//! Received messages stay parked under their acknowledgement token until
//! they are acknowledged (dropped) or released (returned to the head of the
//! queue), so a worker that dies mid-message never loses it silently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use relaybus_core::{
    AcknowledgementToken, ConfigurationError, Queue, QueueError, QueueFactory, QueueUri,
    ReceivedMessage, TransportMessage,
};

/// Scheme served by [`MemoryQueueFactory`].
pub const MEMORY_SCHEME: &str = "memory";

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<TransportMessage>,
    unacknowledged: HashMap<AcknowledgementToken, TransportMessage>,
    disposed: bool,
}

/// Thread-safe in-memory queue.
pub struct MemoryQueue {
    uri: QueueUri,
    state: Mutex<MemoryQueueState>,
    available: Condvar,
    next_token: AtomicU64,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(uri: QueueUri) -> Self {
        Self {
            uri,
            state: Mutex::new(MemoryQueueState::default()),
            available: Condvar::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Number of messages waiting to be received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of received messages not yet acknowledged or released.
    #[must_use]
    pub fn unacknowledged_count(&self) -> usize {
        self.state.lock().unacknowledged.len()
    }

    /// Copies of the waiting messages, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TransportMessage> {
        self.state.lock().ready.iter().cloned().collect()
    }

    fn disposed(&self) -> QueueError {
        QueueError::Disposed {
            uri: self.uri.to_string(),
        }
    }
}

impl Queue for MemoryQueue {
    fn uri(&self) -> &QueueUri {
        &self.uri
    }

    fn enqueue(&self, message: TransportMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(self.disposed());
        }
        state.ready.push_back(message);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn get_message(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.disposed {
                return Err(self.disposed());
            }
            if let Some(message) = state.ready.pop_front() {
                let token = AcknowledgementToken(self.next_token.fetch_add(1, Ordering::Relaxed));
                state.unacknowledged.insert(token, message.clone());
                return Ok(Some(ReceivedMessage { message, token }));
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn acknowledge(&self, token: AcknowledgementToken) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state
            .unacknowledged
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownToken {
                uri: self.uri.to_string(),
                token: token.0,
            })
    }

    fn release(&self, token: AcknowledgementToken) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let message = state
            .unacknowledged
            .remove(&token)
            .ok_or_else(|| QueueError::UnknownToken {
                uri: self.uri.to_string(),
                token: token.0,
            })?;
        state.ready.push_front(message);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn dispose(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.disposed = true;
        state.ready.clear();
        state.unacknowledged.clear();
        drop(state);
        self.available.notify_all();
        Ok(())
    }
}

/// Factory for [`MemoryQueue`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryQueueFactory;

impl QueueFactory for MemoryQueueFactory {
    fn scheme(&self) -> &'static str {
        MEMORY_SCHEME
    }

    fn create(&self, uri: &QueueUri) -> Result<Arc<dyn Queue>, ConfigurationError> {
        uri.require_scheme(MEMORY_SCHEME)?;
        Ok(Arc::new(MemoryQueue::new(uri.clone())))
    }
}
