//! End-to-end behaviour of a running bus.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaybus_core::{
    serializer, AcknowledgementToken, ConfigurationError, MessageType, Queue, QueueError,
    QueueFactory, QueueResolver, QueueUri, ReceivedMessage, TransportMessage,
};
use relaybus_server::queue::MemoryQueueFactory;
use relaybus_server::{
    BusError, DefaultMessageHandlerInvoker, InboxConfiguration, MemoryQueue, QueueManager,
    ServiceBus, ServiceBusConfiguration, ServiceBusSettings,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct SimpleCommand {
    name: String,
}

impl MessageType for SimpleCommand {
    const MESSAGE_TYPE: &'static str = "SimpleCommand";
}

#[derive(Debug, Serialize, Deserialize)]
struct OtherCommand {
    id: u64,
}

impl MessageType for OtherCommand {
    const MESSAGE_TYPE: &'static str = "OtherCommand";
}

/// Yields its seeded messages once, counting every message handed out and
/// every acknowledgement received.
struct FakeQueue {
    uri: QueueUri,
    pending: Mutex<VecDeque<TransportMessage>>,
    message_count: AtomicU64,
    acknowledged: AtomicU64,
    next_token: AtomicU64,
}

impl FakeQueue {
    fn new(messages: Vec<TransportMessage>) -> Self {
        Self {
            uri: QueueUri::parse("fake://localhost/work").unwrap(),
            pending: Mutex::new(messages.into()),
            message_count: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
        }
    }

    fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

impl Queue for FakeQueue {
    fn uri(&self) -> &QueueUri {
        &self.uri
    }

    fn enqueue(&self, _message: TransportMessage) -> Result<(), QueueError> {
        Ok(())
    }

    fn get_message(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let next = self.pending.lock().pop_front();
        match next {
            Some(message) => {
                self.message_count.fetch_add(1, Ordering::SeqCst);
                let token = AcknowledgementToken(self.next_token.fetch_add(1, Ordering::SeqCst));
                Ok(Some(ReceivedMessage { message, token }))
            }
            None => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn acknowledge(&self, _token: AcknowledgementToken) -> Result<(), QueueError> {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _token: AcknowledgementToken) -> Result<(), QueueError> {
        Ok(())
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn memory_inbox(manager: &QueueManager, threads: usize) -> ServiceBusConfiguration {
    ServiceBusConfiguration {
        inbox: Some(
            InboxConfiguration::new(
                manager.get_queue("memory://inbox-work").unwrap(),
                manager.get_queue("memory://inbox-error").unwrap(),
            )
            .with_thread_count(threads)
            .with_poll_timeout(Duration::from_millis(20)),
        ),
        ..ServiceBusConfiguration::default()
    }
}

fn memory_queue(manager: &QueueManager, uri: &str) -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new(QueueUri::parse(uri).unwrap()));
    manager.register_queue(queue.clone());
    queue
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn expired_message_is_consumed_without_invoking_handler() {
    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    invoker.register::<SimpleCommand, _>(|_, _| Ok(()));

    let fresh = serializer::encode(&SimpleCommand { name: "fresh".into() }, 0).unwrap();
    let expired = serializer::encode(&SimpleCommand { name: "stale".into() }, 0)
        .unwrap()
        .with_expiry(1);
    let fake = Arc::new(FakeQueue::new(vec![fresh, expired]));

    let configuration = ServiceBusConfiguration {
        inbox: Some(
            InboxConfiguration::new(fake.clone(), fake.clone())
                .with_thread_count(1)
                .with_poll_timeout(Duration::from_millis(10)),
        ),
        ..ServiceBusConfiguration::default()
    };

    {
        let bus = ServiceBus::builder()
            .configuration(configuration)
            .handler_invoker(invoker.clone())
            .build()
            .unwrap();
        bus.start().unwrap();
        wait_until(Duration::from_millis(500), || fake.message_count() >= 2);
    }

    assert_eq!(invoker.invocation_count("SimpleCommand"), 1);
    assert_eq!(fake.message_count(), 2);
    assert_eq!(fake.acknowledged(), 2);
}

#[test]
fn expired_message_leaves_memory_queue_empty() {
    let manager = Arc::new(QueueManager::with_memory());
    let work = memory_queue(&manager, "memory://inbox-work");
    let error = memory_queue(&manager, "memory://inbox-error");
    work.enqueue(
        serializer::encode(&SimpleCommand { name: "stale".into() }, 0)
            .unwrap()
            .with_expiry(1),
    )
    .unwrap();

    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    invoker.register::<SimpleCommand, _>(|_, _| Ok(()));

    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(memory_inbox(&manager, 1))
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();
    bus.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || bus.stats().inbox.aborted == 1));
    bus.stop().unwrap();

    assert_eq!(invoker.invocation_count("SimpleCommand"), 0);
    assert!(work.is_empty());
    assert_eq!(work.unacknowledged_count(), 0);
    assert!(error.is_empty());
}

#[test]
fn every_message_is_processed_exactly_once() {
    const THREADS: usize = 4;
    const MESSAGES: u64 = 200;

    let manager = Arc::new(QueueManager::with_memory());
    let work = memory_queue(&manager, "memory://inbox-work");
    for id in 0..MESSAGES {
        work.enqueue(serializer::encode(&OtherCommand { id }, 0).unwrap())
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    let seen_in = seen.clone();
    invoker.register::<OtherCommand, _>(move |_, command| {
        seen_in.lock().push(command.id);
        Ok(())
    });

    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(memory_inbox(&manager, THREADS))
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();
    bus.start().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        bus.stats().inbox.completed == MESSAGES
    }));
    bus.stop().unwrap();

    let seen = seen.lock();
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(seen.len() as u64, MESSAGES);
    assert_eq!(unique.len() as u64, MESSAGES);
    assert!(work.is_empty());
    assert_eq!(work.unacknowledged_count(), 0);
}

#[test]
fn failing_handler_does_not_block_other_types() {
    let manager = Arc::new(QueueManager::with_memory());
    let work = memory_queue(&manager, "memory://inbox-work");
    let error = memory_queue(&manager, "memory://inbox-error");

    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    invoker.register::<SimpleCommand, _>(|_, command| {
        anyhow::bail!("cannot handle {}", command.name)
    });
    invoker.register::<OtherCommand, _>(|_, _| Ok(()));

    work.enqueue(serializer::encode(&SimpleCommand { name: "a".into() }, 0).unwrap())
        .unwrap();
    for id in 0..3 {
        work.enqueue(serializer::encode(&OtherCommand { id }, 0).unwrap())
            .unwrap();
    }

    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(memory_inbox(&manager, 1))
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();
    bus.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        bus.stats().inbox.processed() == 4
    }));
    bus.stop().unwrap();

    assert_eq!(invoker.invocation_count("OtherCommand"), 3);
    let stats = bus.stats().inbox;
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.faulted, 1);
    assert_eq!(stats.dead_lettered, 1);

    let dead = error.snapshot();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_type, "SimpleCommand");
    assert!(dead[0].failure_messages[0].contains("cannot handle a"));
}

#[test]
fn retries_until_handler_succeeds() {
    let manager = Arc::new(QueueManager::with_memory());
    let error = memory_queue(&manager, "memory://inbox-error");
    let attempts = Arc::new(AtomicU32::new(0));

    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    let attempts_in = attempts.clone();
    invoker.register::<SimpleCommand, _>(move |_, _| {
        if attempts_in.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("transient");
        }
        Ok(())
    });

    let mut configuration = memory_inbox(&manager, 1);
    if let Some(inbox) = configuration.inbox.take() {
        configuration.inbox = Some(inbox.with_maximum_failure_count(3));
    }
    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(configuration)
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();
    bus.start().unwrap();
    bus.sender()
        .send_local(&SimpleCommand { name: "retry".into() })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        bus.stats().inbox.completed == 1
    }));
    bus.stop().unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(bus.stats().inbox.aborted, 2);
    assert!(error.is_empty());
}

#[test]
fn retries_are_bounded_then_dead_lettered() {
    let manager = Arc::new(QueueManager::with_memory());
    let error = memory_queue(&manager, "memory://inbox-error");
    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    invoker.register::<SimpleCommand, _>(|_, _| anyhow::bail!("permanent"));

    let mut configuration = memory_inbox(&manager, 1);
    if let Some(inbox) = configuration.inbox.take() {
        configuration.inbox = Some(inbox.with_maximum_failure_count(3));
    }
    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(configuration)
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();
    bus.start().unwrap();
    bus.sender()
        .send_local(&SimpleCommand { name: "doomed".into() })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !error.is_empty()));
    bus.stop().unwrap();

    assert_eq!(invoker.invocation_count("SimpleCommand"), 3);
    let dead = error.snapshot();
    assert_eq!(dead[0].failure_count, 3);
    assert_eq!(dead[0].failure_messages.len(), 3);
}

#[test]
fn stop_and_dispose_without_start_spawn_nothing() {
    let manager = Arc::new(QueueManager::with_memory());
    let bus = ServiceBus::builder()
        .queue_manager(manager.clone())
        .configuration(memory_inbox(&manager, 3))
        .build()
        .unwrap();
    bus.stop().unwrap();
    bus.dispose();
    bus.dispose();
    assert_eq!(bus.stats().inbox.received, 0);
    assert!(matches!(bus.start(), Err(BusError::Disposed)));
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn unsupported_scheme_names_scheme_uri_and_supported_schemes() {
    let settings = ServiceBusSettings::from_json_str(
        r#"{ "inbox": { "work_queue_uri": "msmq://localhost/work", "error_queue_uri": "memory://error" } }"#,
    )
    .unwrap();
    let err = match ServiceBus::builder().settings(settings).build() {
        Ok(_) => panic!("bus built with an unsupported scheme"),
        Err(e) => e,
    };
    match err {
        BusError::Configuration(ConfigurationError::UnsupportedScheme { scheme, uri, supported }) => {
            assert_eq!(scheme, "msmq");
            assert_eq!(uri, "msmq://localhost/work");
            assert_eq!(supported, vec!["memory".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn factory_rejects_foreign_scheme() {
    let uri = QueueUri::parse("msmq://localhost/work").unwrap();
    let err = match MemoryQueueFactory.create(&uri) {
        Ok(_) => panic!("memory factory accepted a foreign scheme"),
        Err(e) => e,
    };
    assert_eq!(
        err,
        ConfigurationError::InvalidScheme {
            supported_scheme: "memory".to_string(),
            uri: "msmq://localhost/work".to_string(),
        }
    );
    let text = err.to_string();
    assert!(text.contains("memory"));
    assert!(text.contains("msmq://localhost/work"));
}

#[test]
fn settings_drive_routing_and_outbox() {
    let settings = ServiceBusSettings::from_json_str(
        r#"{
            "inbox": {
                "work_queue_uri": "memory://endpoint-work",
                "error_queue_uri": "memory://endpoint-error",
                "thread_count": 1,
                "poll_timeout_ms": 20
            },
            "outbox": {
                "work_queue_uri": "memory://endpoint-outbox",
                "error_queue_uri": "memory://endpoint-outbox-error",
                "poll_timeout_ms": 20
            },
            "message_routes": [
                { "uri": "memory://endpoint-work",
                  "specifications": [ { "name": "TypeList", "value": "SimpleCommand" } ] },
                { "uri": "memory://elsewhere",
                  "specifications": [ { "name": "StartsWith", "value": "Other" } ] }
            ]
        }"#,
    )
    .unwrap();

    let manager = Arc::new(QueueManager::with_memory());
    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    invoker.register::<SimpleCommand, _>(|_, _| Ok(()));
    let bus = ServiceBus::builder()
        .settings(settings)
        .queue_manager(manager.clone())
        .handler_invoker(invoker.clone())
        .build()
        .unwrap();

    assert_eq!(bus.routes().len(), 2);
    assert_eq!(
        bus.routes().get_route_uris("OtherCommand"),
        vec!["memory://elsewhere".to_string()]
    );

    bus.start().unwrap();
    bus.sender()
        .send(&SimpleCommand { name: "loop".into() })
        .unwrap();
    bus.sender().send(&OtherCommand { id: 9 }).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        invoker.invocation_count("SimpleCommand") == 1 && bus.stats().outbox.completed == 2
    }));
    bus.stop().unwrap();

    let elsewhere = manager.get_queue("memory://elsewhere").unwrap();
    let forwarded = elsewhere.get_message(Duration::ZERO).unwrap().unwrap().message;
    assert_eq!(forwarded.message_type, "OtherCommand");
    assert_eq!(forwarded.sender_uri.as_deref(), Some("memory://endpoint-work"));
}
