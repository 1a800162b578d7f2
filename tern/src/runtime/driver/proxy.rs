//! Producer ends of the inter-agent command queues.
//!
//! The conductor's proxies keep offering to a full queue, idling between
//! attempts, until the retry timeout passes. Every failed offer bumps the
//! proxy's fail counter. A send only fails outright when the agent on the
//! other end has stopped draining, and the caller gets the command name back
//! in [`QueueFull`] so it can undo what it did.

use std::time::Duration;

use thiserror::Error;

use super::commands::{ConductorCommand, ReceiverCommand, SenderCommand};
use crate::counters::Position;
use crate::runtime::agent::{IdleStrategy, Idler};
use crate::sync::{COMMAND_QUEUE_CAPACITY, spsc};
use crate::trace::warn;

pub type SenderCommandQueue = spsc::Consumer<SenderCommand, COMMAND_QUEUE_CAPACITY>;
pub type ReceiverCommandQueue = spsc::Consumer<ReceiverCommand, COMMAND_QUEUE_CAPACITY>;
pub type ConductorCommandQueue = spsc::Consumer<ConductorCommand, COMMAND_QUEUE_CAPACITY>;

/// How a proxy waits on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferRetry {
    pub idle: IdleStrategy,
    /// Give up once this much time has passed since the first failed offer.
    pub timeout: Duration,
}

impl OfferRetry {
    /// A single attempt.
    pub const ONCE: Self = Self {
        idle: IdleStrategy::BusySpin,
        timeout: Duration::ZERO,
    };
}

/// The target agent did not make room within the retry timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{agent} command queue full, {command} not delivered")]
pub struct QueueFull {
    pub agent: &'static str,
    pub command: &'static str,
}

/// Conductor → Sender.
pub struct SenderProxy {
    producer: spsc::Producer<SenderCommand, COMMAND_QUEUE_CAPACITY>,
    retry: OfferRetry,
    fails: Option<Position>,
}

/// Conductor → Receiver.
pub struct ReceiverProxy {
    producer: spsc::Producer<ReceiverCommand, COMMAND_QUEUE_CAPACITY>,
    retry: OfferRetry,
    fails: Option<Position>,
}

/// Receiver → conductor.
pub struct ConductorProxy {
    producer: spsc::Producer<ConductorCommand, COMMAND_QUEUE_CAPACITY>,
}

#[must_use]
pub fn sender_channel(retry: OfferRetry) -> (SenderProxy, SenderCommandQueue) {
    let (producer, consumer) = spsc::channel();
    (
        SenderProxy {
            producer,
            retry,
            fails: None,
        },
        consumer,
    )
}

#[must_use]
pub fn receiver_channel(retry: OfferRetry) -> (ReceiverProxy, ReceiverCommandQueue) {
    let (producer, consumer) = spsc::channel();
    (
        ReceiverProxy {
            producer,
            retry,
            fails: None,
        },
        consumer,
    )
}

#[must_use]
pub fn conductor_channel() -> (ConductorProxy, ConductorCommandQueue) {
    let (producer, consumer) = spsc::channel();
    (ConductorProxy { producer }, consumer)
}

/// Pushes `command`, retrying per `retry`. Hands the command back on timeout.
fn offer<T: Send>(
    producer: &spsc::Producer<T, COMMAND_QUEUE_CAPACITY>,
    command: T,
    retry: OfferRetry,
    fails: Option<&Position>,
) -> Result<(), T> {
    let mut command = match producer.push(command) {
        Ok(()) => return Ok(()),
        Err(command) => command,
    };
    let deadline = minstant::Instant::now() + retry.timeout;
    let mut idler = Idler::new(retry.idle);
    loop {
        if let Some(fails) = fails {
            fails.increment();
        }
        if minstant::Instant::now() >= deadline {
            return Err(command);
        }
        idler.idle(0);
        command = match producer.push(command) {
            Ok(()) => return Ok(()),
            Err(command) => command,
        };
    }
}

impl SenderProxy {
    /// Counts every failed offer in `fails`.
    #[must_use]
    pub fn with_fail_counter(mut self, fails: Position) -> Self {
        self.fails = Some(fails);
        self
    }

    /// # Errors
    ///
    /// [`QueueFull`] if the Sender did not drain its queue in time.
    pub fn send(&self, command: SenderCommand) -> Result<(), QueueFull> {
        offer(&self.producer, command, self.retry, self.fails.as_ref()).map_err(|dropped| {
            warn!(
                command = dropped.name(),
                "sender command queue full, command not delivered"
            );
            QueueFull {
                agent: "sender",
                command: dropped.name(),
            }
        })
    }
}

impl ReceiverProxy {
    /// Counts every failed offer in `fails`.
    #[must_use]
    pub fn with_fail_counter(mut self, fails: Position) -> Self {
        self.fails = Some(fails);
        self
    }

    /// # Errors
    ///
    /// [`QueueFull`] if the Receiver did not drain its queue in time.
    pub fn send(&self, command: ReceiverCommand) -> Result<(), QueueFull> {
        offer(&self.producer, command, self.retry, self.fails.as_ref()).map_err(|dropped| {
            warn!(
                command = dropped.name(),
                "receiver command queue full, command not delivered"
            );
            QueueFull {
                agent: "receiver",
                command: dropped.name(),
            }
        })
    }
}

impl ConductorProxy {
    /// Returns `false` if the queue was full; the Receiver retries on the next frame.
    pub fn send(&self, command: ConductorCommand) -> bool {
        if self.producer.push(command).is_err() {
            warn!("conductor command queue full, dropping CreateConnection");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::control::types::StreamId;
    use crate::counters::CountersManager;

    fn add(stream: i32) -> ReceiverCommand {
        ReceiverCommand::AddSubscription {
            canonical: "c".into(),
            stream_id: StreamId(stream),
        }
    }

    #[test]
    fn full_queue_gives_up_after_timeout() {
        let mut counters = CountersManager::new(1);
        let fails = counters.new_position("receiver proxy fails").unwrap();
        let retry = OfferRetry {
            idle: IdleStrategy::Yielding,
            timeout: Duration::from_millis(2),
        };
        let (proxy, queue) = receiver_channel(retry);
        let proxy = proxy.with_fail_counter(fails.clone());
        for i in 0..COMMAND_QUEUE_CAPACITY {
            proxy.send(add(i as i32)).unwrap();
        }
        assert_eq!(fails.get(), 0);

        assert_eq!(
            proxy.send(add(-1)),
            Err(QueueFull {
                agent: "receiver",
                command: "AddSubscription"
            })
        );
        assert!(fails.get() >= 1);
        assert_eq!(queue.drain(usize::MAX, drop), COMMAND_QUEUE_CAPACITY);
    }

    #[test]
    fn retry_delivers_once_the_agent_drains() {
        let retry = OfferRetry {
            idle: IdleStrategy::Yielding,
            timeout: Duration::from_secs(5),
        };
        let (proxy, queue) = receiver_channel(retry);
        for i in 0..COMMAND_QUEUE_CAPACITY {
            proxy.send(add(i as i32)).unwrap();
        }

        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            let mut seen = 0;
            while seen <= COMMAND_QUEUE_CAPACITY {
                seen += queue.drain(usize::MAX, drop);
                thread::yield_now();
            }
            seen
        });
        assert_eq!(proxy.send(add(-1)), Ok(()));
        assert_eq!(drainer.join().unwrap(), COMMAND_QUEUE_CAPACITY + 1);
    }

    #[test]
    fn single_attempt_fails_immediately() {
        let (proxy, _queue) = sender_channel(OfferRetry::ONCE);
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            proxy
                .send(SenderCommand::CloseSendChannelEndpoint {
                    canonical: "c".into(),
                })
                .unwrap();
        }
        assert!(
            proxy
                .send(SenderCommand::CloseSendChannelEndpoint {
                    canonical: "c".into(),
                })
                .is_err()
        );
    }
}
