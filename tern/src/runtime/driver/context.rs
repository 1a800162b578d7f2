//! Everything the conductor needs, wired together before it starts.

use std::sync::Arc;

use super::config::{ConfigError, DriverConfig};
use super::proxy::{
    ConductorCommandQueue, ConductorProxy, OfferRetry, ReceiverCommandQueue, ReceiverProxy,
    SenderCommandQueue, SenderProxy, conductor_channel, receiver_channel, sender_channel,
};
use crate::buffer::{HeapLogFactory, LogFactory};
use crate::control::{ClientProxy, ResponseConsumer, ToDriverBuffer, ToDriverHandle, response_channel};
use crate::counters::{CountersManager, CountersReader};
use crate::events::{DriverEvent, EventLogger, EventReader, event_log};
use crate::runtime::timing::NanoClock;
use crate::trace::debug;

/// Handler for events drained from the event log.
pub type EventConsumer = Box<dyn FnMut(&DriverEvent) + Send>;

/// Conductor-side resources. Consumed by [`DriverConductor::new`](super::DriverConductor::new).
pub struct ConductorContext {
    pub(super) config: DriverConfig,
    pub(super) clock: Arc<dyn NanoClock>,
    pub(super) to_driver: ToDriverBuffer,
    pub(super) client_proxy: ClientProxy,
    pub(super) sender_proxy: SenderProxy,
    pub(super) receiver_proxy: ReceiverProxy,
    pub(super) conductor_commands: ConductorCommandQueue,
    pub(super) counters: CountersManager,
    pub(super) log_factory: Box<dyn LogFactory>,
    pub(super) event_logger: EventLogger,
    pub(super) event_reader: EventReader,
    pub(super) event_consumer: EventConsumer,
}

/// The other ends of every queue the conductor talks through.
pub struct DriverQueues {
    /// Read by the Sender.
    pub sender_commands: SenderCommandQueue,
    /// Read by the Receiver.
    pub receiver_commands: ReceiverCommandQueue,
    /// Used by the Receiver to report new sessions.
    pub conductor: ConductorProxy,
    /// Read by the client library.
    pub responses: ResponseConsumer,
    /// Attaches clients to the command buffer.
    pub to_driver: ToDriverHandle,
    pub counters: CountersReader,
    pub events: EventLogger,
}

impl ConductorContext {
    /// Validates `config` and creates every queue.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from [`DriverConfig::validate`].
    pub fn new(
        config: DriverConfig,
        clock: Arc<dyn NanoClock>,
    ) -> Result<(Self, DriverQueues), ConfigError> {
        config.validate()?;

        let to_driver = ToDriverBuffer::new();
        let (client_proxy, responses) = response_channel();
        let retry = OfferRetry {
            idle: config.idle_strategy,
            timeout: config.command_offer_timeout,
        };
        let (sender_proxy, sender_commands) = sender_channel(retry);
        let (receiver_proxy, receiver_commands) = receiver_channel(retry);
        let (conductor, conductor_commands) = conductor_channel();
        let counters = CountersManager::new(config.counters_capacity);
        let (event_logger, event_reader) = event_log(Arc::clone(&clock));

        let queues = DriverQueues {
            sender_commands,
            receiver_commands,
            conductor,
            responses,
            to_driver: to_driver.handle(),
            counters: counters.reader(),
            events: event_logger.clone(),
        };

        let ctx = Self {
            log_factory: Box::new(HeapLogFactory::new(config.term_buffer_length)),
            config,
            clock,
            to_driver,
            client_proxy,
            sender_proxy,
            receiver_proxy,
            conductor_commands,
            counters,
            event_logger,
            event_reader,
            event_consumer: Box::new(log_event),
        };
        Ok((ctx, queues))
    }

    /// Replaces the heap-backed log factory.
    #[must_use]
    pub fn with_log_factory(mut self, factory: Box<dyn LogFactory>) -> Self {
        self.log_factory = factory;
        self
    }

    /// Replaces the default `debug!` event sink.
    #[must_use]
    pub fn with_event_consumer(mut self, consumer: EventConsumer) -> Self {
        self.event_consumer = consumer;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn log_event(event: &DriverEvent) {
    debug!(
        code = %event.code,
        timestamp = %event.timestamp,
        detail = %event.detail,
        "driver event"
    );
}
