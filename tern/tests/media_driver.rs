//! The driver on real threads, with stand-in Sender and Receiver agents.
//!
//! The stand-ins do no frame I/O. The Receiver answers every new subscription
//! with a session as if a SETUP had arrived, and confirms endpoint closes and
//! released handles; the Sender records what it was told to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use tern::control::{ClientId, DriverResponse, ResponseConsumer, SessionId, StreamId};
use tern::net::Endpoint;
use tern::runtime::agent::{Agent, IdleStrategy};
use tern::runtime::driver::commands::{ConductorCommand, ReceiverCommand, SenderCommand};
use tern::runtime::driver::{
    ConductorProxy, DriverConfig, MediaDriver, ReceiverCommandQueue, ReceiverQueues,
    SenderCommandQueue, SenderQueues,
};
use tern::runtime::timing::SystemNanoClock;
use tern::runtime::topology::CpuConfig;

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        tern::init_tracing();
    });
}

const CHANNEL: &str = "udp://127.0.0.1:40456";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

struct FakeSender {
    commands: SenderCommandQueue,
    seen: Arc<Mutex<Vec<&'static str>>>,
    closed: Arc<AtomicBool>,
}

impl Agent for FakeSender {
    fn role_name(&self) -> &'static str {
        "fake-sender"
    }

    fn do_work(&mut self) -> usize {
        let seen = &self.seen;
        self.commands.drain(64, |command| {
            let name = match command {
                SenderCommand::RegisterSendChannelEndpoint { .. } => "register",
                SenderCommand::NewPublication { .. } => "new-publication",
                SenderCommand::ClosePublication { released, .. } => {
                    released.store(true, Ordering::Release);
                    "close-publication"
                }
                SenderCommand::CloseSendChannelEndpoint { .. } => "close-endpoint",
            };
            if let Ok(mut seen) = seen.lock() {
                seen.push(name);
            }
        })
    }

    fn on_close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct FakeReceiver {
    commands: ReceiverCommandQueue,
    conductor: ConductorProxy,
    next_session: i32,
}

impl Agent for FakeReceiver {
    fn role_name(&self) -> &'static str {
        "fake-receiver"
    }

    fn do_work(&mut self) -> usize {
        let mut batch = Vec::new();
        let read = self.commands.drain(64, |command| batch.push(command));
        for command in batch {
            match command {
                ReceiverCommand::AddSubscription {
                    canonical,
                    stream_id,
                } => {
                    self.next_session += 1;
                    self.conductor.send(ConductorCommand::CreateConnection {
                        canonical,
                        session_id: SessionId(self.next_session),
                        stream_id,
                        initial_term_id: 7,
                        active_term_id: 7,
                        term_offset: 0,
                        term_length: 64 * 1024,
                        mtu_length: 1408,
                        window_length: 64 * 1024,
                        control_address: Endpoint::localhost(40457),
                        source_address: Endpoint::localhost(40458),
                    });
                }
                ReceiverCommand::CloseReceiveChannelEndpoint { closed, .. } => {
                    closed.store(true, Ordering::Release);
                }
                ReceiverCommand::RemoveConnection { released, .. } => {
                    released.store(true, Ordering::Release);
                }
                _ => {}
            }
        }
        read
    }
}

fn launch() -> (MediaDriver, Arc<Mutex<Vec<&'static str>>>, Arc<AtomicBool>) {
    init_test_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sender_closed = Arc::new(AtomicBool::new(false));
    let config = DriverConfig::default()
        .with_term_buffer_length(64 * 1024)
        .with_cpu(CpuConfig::Disabled)
        .with_idle_strategy(IdleStrategy::Yielding);

    let sender_seen = Arc::clone(&seen);
    let closed = Arc::clone(&sender_closed);
    let driver = MediaDriver::launch(
        config,
        Arc::new(SystemNanoClock::new()),
        move |queues: SenderQueues| FakeSender {
            commands: queues.commands,
            seen: sender_seen,
            closed,
        },
        |queues: ReceiverQueues| FakeReceiver {
            commands: queues.commands,
            conductor: queues.conductor,
            next_session: 0,
        },
    )
    .expect("driver launches");
    (driver, seen, sender_closed)
}

/// Polls until `count` responses arrived or the timeout passed.
fn await_responses(responses: &ResponseConsumer, count: usize) -> Vec<DriverResponse> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut out = Vec::new();
    while out.len() < count && Instant::now() < deadline {
        match responses.pop() {
            Some(response) => out.push(response),
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    out
}

#[test]
fn publication_round_trip() {
    let (driver, seen, sender_closed) = launch();
    let mut client = driver.client(ClientId(1));

    let registration = client
        .add_publication(CHANNEL, SessionId(5), StreamId(10))
        .expect("submit");
    let responses = await_responses(driver.responses(), 1);
    match responses.as_slice() {
        [DriverResponse::PublicationReady {
            correlation_id,
            publisher_limit_id,
            ..
        }] => {
            assert_eq!(*correlation_id, registration);
            assert!(driver.counters().get(*publisher_limit_id).is_some());
        }
        other => panic!("expected PublicationReady, got {other:?}"),
    }

    let removal = client.remove_publication(registration).expect("submit");
    let responses = await_responses(driver.responses(), 1);
    assert!(matches!(
        responses.as_slice(),
        [DriverResponse::OperationSucceeded { correlation_id }] if *correlation_id == removal
    ));

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while seen.lock().expect("lock").len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        &seen.lock().expect("lock")[..2],
        &["register", "new-publication"]
    );

    driver.shutdown();
    assert!(sender_closed.load(Ordering::Acquire));
}

#[test]
fn subscription_receives_a_session() {
    let (driver, _, _) = launch();
    let mut client = driver.client(ClientId(2));

    let registration = client
        .add_subscription(CHANNEL, StreamId(11))
        .expect("submit");
    let responses = await_responses(driver.responses(), 2);
    assert_eq!(responses.len(), 2);
    assert!(matches!(
        responses[0],
        DriverResponse::OperationSucceeded { correlation_id } if correlation_id == registration
    ));
    match &responses[1] {
        DriverResponse::ConnectionReady {
            session_id,
            stream_id,
            joining_position,
            subscriber_positions,
            source_info,
            ..
        } => {
            assert_eq!(*session_id, SessionId(1));
            assert_eq!(*stream_id, StreamId(11));
            assert_eq!(*joining_position, 0);
            assert_eq!(subscriber_positions.len(), 1);
            assert_eq!(subscriber_positions[0].registration_id, registration);
            assert_eq!(source_info, "127.0.0.1:40458");
        }
        other => panic!("expected ConnectionReady, got {other:?}"),
    }

    let removal = client.remove_subscription(registration).expect("submit");
    let responses = await_responses(driver.responses(), 1);
    assert!(matches!(
        responses.as_slice(),
        [DriverResponse::OperationSucceeded { correlation_id }] if *correlation_id == removal
    ));

    driver.shutdown();
}

#[test]
fn dropping_the_handle_stops_agents() {
    let (driver, _, _) = launch();
    let running = driver.running_flag();
    assert!(running.load(Ordering::Acquire));
    drop(driver);
    assert!(!running.load(Ordering::Acquire));
}
