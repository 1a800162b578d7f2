//! The driver conductor: sole owner of every channel, publication,
//! subscription and connection.
//!
//! Each duty cycle, in order:
//! 1. client commands from the command buffer
//! 2. commands the Receiver posted back (new sessions)
//! 3. up to `event_reader_frame_limit` driver events
//! 4. due timers; the heartbeat sweep reaps clients, links, publications and connections
//! 5. per-connection rebuild tracking and per-publication limit and cleaning upkeep
//! 6. freeing the counters of removed entities the Sender or Receiver has let go of
//!
//! Two waits are bounded: the receive endpoint close handshake by
//! `endpoint_close_timeout`, and offers to a full Sender or Receiver queue by
//! `command_offer_timeout`. A command that is never delivered fails the
//! client request that caused it, and any state created for that request is
//! undone.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::client::AeronClient;
use super::commands::{ConductorCommand, ReceiverCommand, SenderCommand};
use super::config::{ConfigError, DriverConfig, is_valid_mtu};
use super::connection::{ConnectionParams, ConnectionStatus, NetworkConnection};
use super::context::{ConductorContext, EventConsumer};
use super::endpoint::{EndpointRegistry, ReceiveChannelEndpoint, SendChannelEndpoint, await_close};
use super::error::{ConductorError, ControlProtocolError};
use super::flow_control;
use super::loss::LossGenerator;
use super::proxy::{ConductorCommandQueue, QueueFull, ReceiverProxy, SenderProxy};
use super::publication::{NetworkPublication, PublicationKey, PublicationLink};
use super::retransmit::RetransmitHandler;
use super::subscription::SubscriptionLink;
use crate::buffer::descriptor::{check_term_length, compute_position, position_bits_to_shift};
use crate::buffer::{LogFactory, LogIdentity};
use crate::control::client_proxy::ConnectionReady;
use crate::control::command::peek_correlation_id;
use crate::control::types::{ClientId, CorrelationId, SessionId, StreamId, SubscriberPositionInfo};
use crate::control::{ClientCommand, ClientProxy, CommandFrame, DecodeError, ToDriverBuffer};
use crate::counters::{CountersManager, Position, SystemCounters, position_label};
use crate::events::{EventCode, EventLogger, EventReader};
use crate::net::UdpChannel;
use crate::runtime::agent::Agent;
use crate::runtime::timing::{NanoClock, NanoDuration, NanoTime, PowerOfTwo, Wheel, WheelConfig, WheelError};
use crate::sync::COMMAND_QUEUE_CAPACITY;
use crate::trace::{debug, info, warn};

/// Conductor timers only ever carry the sweep; per-entity deadlines are
/// checked by the sweep itself.
const TIMER_CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => panic!("timer capacity must be non-zero"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConductorTimer {
    HeartbeatCheck,
}

/// Counters of a removed entity, held until the agent writing them sets `released`.
struct RetiredPositions {
    released: Arc<AtomicBool>,
    positions: Vec<Position>,
}

pub struct DriverConductor {
    config: DriverConfig,
    clock: Arc<dyn NanoClock>,
    to_driver: ToDriverBuffer,
    client_proxy: ClientProxy,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    conductor_commands: ConductorCommandQueue,
    counters: CountersManager,
    system_counters: SystemCounters,
    log_factory: Box<dyn LogFactory>,
    events: EventLogger,
    event_reader: EventReader,
    event_consumer: EventConsumer,
    wheel: Wheel<ConductorTimer>,

    send_endpoints: EndpointRegistry<SendChannelEndpoint>,
    receive_endpoints: EndpointRegistry<ReceiveChannelEndpoint>,
    clients: HashMap<ClientId, AeronClient>,
    publications: HashMap<PublicationKey, NetworkPublication>,
    publication_links: HashMap<CorrelationId, PublicationLink>,
    subscription_links: HashMap<CorrelationId, SubscriptionLink>,
    connections: HashMap<CorrelationId, NetworkConnection>,

    heartbeat_interval: NanoDuration,
    client_liveness_timeout: NanoDuration,
    connection_liveness_timeout: NanoDuration,
    publication_linger: NanoDuration,
    command_batch: Vec<CommandFrame>,
    conductor_batch: Vec<ConductorCommand>,
    retired: Vec<RetiredPositions>,
}

impl DriverConductor {
    /// Builds the conductor and schedules its first heartbeat sweep.
    ///
    /// # Errors
    ///
    /// Fails if the system counters do not fit the counters region or the
    /// timer wheel geometry is invalid.
    pub fn new(ctx: ConductorContext) -> Result<Self, ConductorError> {
        let ConductorContext {
            config,
            clock,
            to_driver,
            client_proxy,
            sender_proxy,
            receiver_proxy,
            conductor_commands,
            mut counters,
            log_factory,
            event_logger,
            event_reader,
            event_consumer,
        } = ctx;

        let system_counters = SystemCounters::allocate(&mut counters)?;
        let client_proxy =
            client_proxy.with_drop_counter(system_counters.client_responses_dropped.clone());
        let sender_proxy = sender_proxy.with_fail_counter(system_counters.sender_proxy_fails.clone());
        let receiver_proxy =
            receiver_proxy.with_fail_counter(system_counters.receiver_proxy_fails.clone());
        let now = clock.now();
        let slots = PowerOfTwo::new(config.timer_wheel_slots)
            .ok_or(ConfigError::WheelSlots(config.timer_wheel_slots))?;
        let mut wheel = Wheel::new(
            WheelConfig {
                slots,
                tick: NanoDuration::from_std(config.timer_tick),
                capacity: TIMER_CAPACITY,
            },
            now,
        )?;
        let heartbeat_interval = NanoDuration::from_std(config.heartbeat_interval);
        if wheel
            .schedule_after(now, heartbeat_interval, ConductorTimer::HeartbeatCheck)
            .is_err()
        {
            return Err(WheelError::Full.into());
        }
        to_driver.set_consumer_heartbeat(now);

        info!(
            mtu = config.mtu_length,
            term_length = config.term_buffer_length,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            "conductor ready"
        );

        Ok(Self {
            client_liveness_timeout: NanoDuration::from_std(config.client_liveness_timeout),
            connection_liveness_timeout: NanoDuration::from_std(config.connection_liveness_timeout),
            publication_linger: NanoDuration::from_std(config.publication_linger),
            heartbeat_interval,
            config,
            clock,
            to_driver,
            client_proxy,
            sender_proxy,
            receiver_proxy,
            conductor_commands,
            counters,
            system_counters,
            log_factory,
            events: event_logger,
            event_reader,
            event_consumer,
            wheel,
            send_endpoints: EndpointRegistry::default(),
            receive_endpoints: EndpointRegistry::default(),
            clients: HashMap::new(),
            publications: HashMap::new(),
            publication_links: HashMap::new(),
            subscription_links: HashMap::new(),
            connections: HashMap::new(),
            command_batch: Vec::new(),
            conductor_batch: Vec::new(),
            retired: Vec::new(),
        })
    }

    /// One duty cycle. Returns the work done; zero means the runner may idle.
    pub fn do_work(&mut self) -> usize {
        let now = self.clock.now();

        let mut work = self.process_client_commands(now);
        work += self.process_conductor_commands(now);
        work += self.process_events();
        work += self.process_timers(now);

        for connection in self.connections.values_mut() {
            work += connection.track_rebuild();
        }
        for publication in self.publications.values_mut() {
            work += publication.update_publisher_limit();
            work += publication.clean_log_buffer();
        }
        work + self.free_released_positions()
    }

    fn process_client_commands(&mut self, now: NanoTime) -> usize {
        let mut batch = std::mem::take(&mut self.command_batch);
        let read = self.to_driver.read(|frame| batch.push(frame));
        for frame in batch.drain(..) {
            self.on_client_command(&frame, now);
        }
        self.command_batch = batch;
        read
    }

    fn process_conductor_commands(&mut self, now: NanoTime) -> usize {
        let mut batch = std::mem::take(&mut self.conductor_batch);
        let read = self
            .conductor_commands
            .drain(COMMAND_QUEUE_CAPACITY, |command| batch.push(command));
        for command in batch.drain(..) {
            if let Err(error) = self.on_conductor_command(command, now) {
                warn!(error = %error, "failed to create connection");
                self.events.log(EventCode::Exception, error.to_string());
                self.system_counters.errors.increment();
            }
        }
        self.conductor_batch = batch;
        read
    }

    fn process_events(&mut self) -> usize {
        let consumer = &mut self.event_consumer;
        let read = self
            .event_reader
            .read(self.config.event_reader_frame_limit, |event| consumer(&event));
        let dropped = i64::try_from(self.event_reader.dropped()).unwrap_or(i64::MAX);
        self.system_counters.events_dropped.propose_max_ordered(dropped);
        read
    }

    fn process_timers(&mut self, now: NanoTime) -> usize {
        let mut heartbeat_due = false;
        let fired = self.wheel.expire(now, |_, timer| match timer {
            ConductorTimer::HeartbeatCheck => heartbeat_due = true,
        });
        if heartbeat_due {
            self.on_heartbeat_check(now);
        }
        fired
    }

    // ---- client commands ----

    fn on_client_command(&mut self, frame: &CommandFrame, now: NanoTime) {
        let command = match ClientCommand::decode(frame.msg_type_id, &frame.payload) {
            Ok(command) => command,
            Err(DecodeError::UnknownType(_msg_type_id)) => {
                debug!(msg_type_id = _msg_type_id, "ignoring unknown command type");
                return;
            }
            Err(error) => {
                let correlation_id = peek_correlation_id(&frame.payload);
                self.on_command_failed(frame, correlation_id, &error.into());
                return;
            }
        };

        self.log_command(&command);
        let correlation_id = command.correlation_id();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(command, now)))
            .unwrap_or_else(|payload| Err(ConductorError::Panicked(panic_message(&*payload))));
        if let Err(error) = result {
            self.on_command_failed(frame, correlation_id, &error);
        }
    }

    fn dispatch(&mut self, command: ClientCommand, now: NanoTime) -> Result<(), ConductorError> {
        match command {
            ClientCommand::AddPublication {
                client_id,
                correlation_id,
                session_id,
                stream_id,
                channel,
            } => self.on_add_publication(client_id, correlation_id, session_id, stream_id, &channel, now),
            ClientCommand::RemovePublication {
                correlation_id,
                registration_id,
                ..
            } => self.on_remove_publication(correlation_id, registration_id),
            ClientCommand::AddSubscription {
                client_id,
                correlation_id,
                stream_id,
                channel,
            } => self.on_add_subscription(client_id, correlation_id, stream_id, &channel, now),
            ClientCommand::RemoveSubscription {
                correlation_id,
                registration_id,
                ..
            } => self.on_remove_subscription(correlation_id, registration_id),
            ClientCommand::ClientKeepalive { client_id } => {
                self.on_client_keepalive(client_id, now);
                Ok(())
            }
        }
    }

    fn log_command(&self, command: &ClientCommand) {
        let code = match command {
            ClientCommand::AddPublication { .. } => EventCode::CmdInAddPublication,
            ClientCommand::RemovePublication { .. } => EventCode::CmdInRemovePublication,
            ClientCommand::AddSubscription { .. } => EventCode::CmdInAddSubscription,
            ClientCommand::RemoveSubscription { .. } => EventCode::CmdInRemoveSubscription,
            ClientCommand::ClientKeepalive { .. } => EventCode::CmdInKeepalive,
        };
        self.events.log(code, format!("{command:?}"));
    }

    fn on_command_failed(
        &self,
        frame: &CommandFrame,
        correlation_id: Option<CorrelationId>,
        error: &ConductorError,
    ) {
        warn!(
            msg_type_id = frame.msg_type_id,
            correlation_id = ?correlation_id,
            error = %error,
            "command failed"
        );
        self.events.log(EventCode::Exception, error.to_string());
        self.system_counters.errors.increment();
        self.client_proxy.on_error(
            error.error_code(),
            error.to_string(),
            frame.msg_type_id,
            correlation_id,
            frame.payload.len(),
        );
    }

    /// Registration ids are shared by publication and subscription links.
    fn ensure_unregistered(&self, registration_id: CorrelationId) -> Result<(), ConductorError> {
        if self.publication_links.contains_key(&registration_id)
            || self.subscription_links.contains_key(&registration_id)
        {
            return Err(ControlProtocolError::duplicate_registration(registration_id).into());
        }
        Ok(())
    }

    fn get_or_add_client(&mut self, client_id: ClientId, now: NanoTime) {
        self.clients
            .entry(client_id)
            .or_insert_with(|| AeronClient::new(client_id, now));
    }

    fn on_add_publication(
        &mut self,
        client_id: ClientId,
        correlation_id: CorrelationId,
        session_id: SessionId,
        stream_id: StreamId,
        channel: &str,
        now: NanoTime,
    ) -> Result<(), ConductorError> {
        self.ensure_unregistered(correlation_id)?;
        let udp_channel = UdpChannel::parse(channel)?;
        let endpoint_created = self.ensure_send_endpoint(&udp_channel)?;

        let key = PublicationKey {
            canonical: udp_channel.canonical_form().to_owned(),
            session_id,
            stream_id,
        };
        if !self.publications.contains_key(&key) {
            if let Err(error) = self.create_publication(&udp_channel, key.clone(), correlation_id, now) {
                if endpoint_created {
                    self.close_send_endpoint_if_unused(&key.canonical);
                }
                return Err(error);
            }
        }

        self.get_or_add_client(client_id, now);
        let Some(publication) = self.publications.get_mut(&key) else {
            return Err(ControlProtocolError::unknown_publication(correlation_id).into());
        };
        publication.inc_ref();
        self.publication_links.insert(
            correlation_id,
            PublicationLink {
                registration_id: correlation_id,
                client_id,
                publication: key,
            },
        );

        debug!(
            client = %client_id,
            correlation_id = %correlation_id,
            refs = publication.ref_count(),
            "publication link added"
        );
        self.client_proxy.on_publication_ready(
            channel,
            stream_id,
            session_id,
            publication.log(),
            correlation_id,
            publication.publisher_limit().id(),
        );
        Ok(())
    }

    /// Returns whether the endpoint was created by this call.
    fn ensure_send_endpoint(&mut self, udp_channel: &UdpChannel) -> Result<bool, ConductorError> {
        let mtu = self.config.mtu_length;
        let sndbuf = self.config.socket_sndbuf_length;
        let (_, created) = self
            .send_endpoints
            .get_or_try_create(udp_channel.canonical_form(), || {
                if !is_valid_mtu(mtu) {
                    return Err(ControlProtocolError::invalid_channel(format!(
                        "mtu length {mtu} is not a valid frame size"
                    )));
                }
                if mtu > sndbuf {
                    return Err(ControlProtocolError::invalid_channel(format!(
                        "mtu length {mtu} greater than socket send buffer {sndbuf}"
                    )));
                }
                Ok(SendChannelEndpoint::new(udp_channel.clone()))
            })?;

        if created {
            let registered = self.sender_proxy.send(SenderCommand::RegisterSendChannelEndpoint {
                channel: udp_channel.clone(),
                control_loss: LossGenerator::new(
                    self.config.control_loss_rate,
                    self.config.control_loss_seed,
                ),
            });
            if let Err(error) = registered {
                self.send_endpoints.remove(udp_channel.canonical_form());
                return Err(error.into());
            }
            info!(channel = %udp_channel, "send endpoint created");
            self.events
                .log(EventCode::ChannelCreated, udp_channel.to_string());
        }
        Ok(created)
    }

    fn create_publication(
        &mut self,
        udp_channel: &UdpChannel,
        key: PublicationKey,
        correlation_id: CorrelationId,
        now: NanoTime,
    ) -> Result<(), ConductorError> {
        let initial_term_id: i32 = rand::random();
        let retransmit = RetransmitHandler::new(
            now,
            NanoDuration::from_std(self.config.timer_tick),
            NanoDuration::from_std(self.config.retransmit_delay),
            NanoDuration::from_std(self.config.retransmit_linger),
        )?;
        let log = self.log_factory.new_publication(
            LogIdentity {
                canonical_channel: &key.canonical,
                session_id: key.session_id,
                stream_id: key.stream_id,
                correlation_id,
            },
            initial_term_id,
            self.config.mtu_length,
        )?;

        let label = |kind| {
            position_label(kind, &key.canonical, key.session_id, key.stream_id, correlation_id)
        };
        let sender_position = self.counters.new_position(label("sender pos"))?;
        let publisher_limit = match self.counters.new_position(label("publisher limit")) {
            Ok(position) => position,
            Err(error) => {
                self.free_position(&sender_position);
                return Err(error.into());
            }
        };

        let mut flow_control = flow_control::for_channel(udp_channel.is_multicast());
        publisher_limit
            .set_ordered(flow_control.initial_position_limit(initial_term_id, log.term_length()));

        let publication = NetworkPublication::new(
            key.clone(),
            udp_channel.uri().to_owned(),
            udp_channel.remote_data(),
            initial_term_id,
            log,
            sender_position,
            publisher_limit,
        );
        let queued = self.sender_proxy.send(SenderCommand::NewPublication {
            publication: publication.handle(),
            retransmit,
            flow_control,
        });
        if let Err(error) = queued {
            // The Sender never saw the handle.
            self.free_position(publication.sender_position());
            self.free_position(publication.publisher_limit());
            return Err(error.into());
        }
        if let Some(endpoint) = self.send_endpoints.get_mut(&key.canonical) {
            endpoint.add_publication(key.session_id, key.stream_id);
        }
        self.system_counters.publications_created.increment();
        info!(
            channel = %key.canonical,
            session = %key.session_id,
            stream = %key.stream_id,
            initial_term_id,
            "publication created"
        );
        self.publications.insert(key, publication);
        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        correlation_id: CorrelationId,
        registration_id: CorrelationId,
    ) -> Result<(), ConductorError> {
        let link = self
            .publication_links
            .remove(&registration_id)
            .ok_or_else(|| ControlProtocolError::unknown_publication(registration_id))?;
        self.release_publication_link(&link);
        self.client_proxy.on_operation_succeeded(correlation_id);
        Ok(())
    }

    fn release_publication_link(&mut self, link: &PublicationLink) {
        if let Some(publication) = self.publications.get_mut(&link.publication) {
            let _refs = publication.dec_ref();
            debug!(
                registration_id = %link.registration_id,
                refs = _refs,
                "publication link removed"
            );
        }
    }

    fn on_add_subscription(
        &mut self,
        client_id: ClientId,
        correlation_id: CorrelationId,
        stream_id: StreamId,
        channel: &str,
        now: NanoTime,
    ) -> Result<(), ConductorError> {
        self.ensure_unregistered(correlation_id)?;
        let udp_channel = UdpChannel::parse(channel)?;
        let canonical = udp_channel.canonical_form().to_owned();

        let (endpoint, created) = self
            .receive_endpoints
            .get_or_try_create(&canonical, || {
                Ok::<_, ConductorError>(ReceiveChannelEndpoint::new(udp_channel.clone()))
            })?;
        if created {
            let registered = self
                .receiver_proxy
                .send(ReceiverCommand::RegisterReceiveChannelEndpoint {
                    channel: udp_channel.clone(),
                    data_loss: LossGenerator::new(
                        self.config.data_loss_rate,
                        self.config.data_loss_seed,
                    ),
                });
            if let Err(error) = registered {
                self.receive_endpoints.remove(&canonical);
                return Err(error.into());
            }
            info!(channel = %udp_channel, "receive endpoint created");
            self.events
                .log(EventCode::ChannelCreated, udp_channel.to_string());
        }
        if endpoint.inc_ref_to_stream(stream_id) == 1 {
            let added = self.receiver_proxy.send(ReceiverCommand::AddSubscription {
                canonical: canonical.clone(),
                stream_id,
            });
            if let Err(error) = added {
                endpoint.dec_ref_to_stream(stream_id);
                if endpoint.stream_count() == 0 {
                    self.close_receive_endpoint(&canonical);
                }
                return Err(error.into());
            }
        }

        self.get_or_add_client(client_id, now);
        let mut link = SubscriptionLink::new(
            correlation_id,
            client_id,
            canonical.clone(),
            channel.to_owned(),
            stream_id,
        );
        self.client_proxy.on_operation_succeeded(correlation_id);

        for connection in self.connections.values_mut() {
            if connection.status() != ConnectionStatus::Active
                || !connection.matches(&canonical, stream_id)
            {
                continue;
            }
            let label = position_label(
                "subscriber pos",
                &canonical,
                connection.session_id(),
                stream_id,
                correlation_id,
            );
            let position = match self.counters.new_position(label) {
                Ok(position) => position,
                Err(_e) => {
                    warn!(
                        connection = %connection.correlation_id(),
                        error = %_e,
                        "no subscriber position for late join"
                    );
                    continue;
                }
            };
            let rebuild_position = connection.rebuild_position();
            position.set_ordered(rebuild_position);
            connection.add_subscriber(correlation_id, position.clone());
            link.add_position(connection.correlation_id(), position.clone());

            self.client_proxy.on_connection_ready(ConnectionReady {
                channel,
                stream_id,
                session_id: connection.session_id(),
                joining_position: rebuild_position,
                log: connection.log(),
                correlation_id: connection.correlation_id(),
                subscriber_positions: vec![SubscriberPositionInfo {
                    registration_id: correlation_id,
                    counter_id: position.id(),
                }],
                source_info: connection.source_address().source_info(),
            });
        }

        debug!(
            client = %client_id,
            correlation_id = %correlation_id,
            connections = link.position_count(),
            "subscription link added"
        );
        self.subscription_links.insert(correlation_id, link);
        Ok(())
    }

    fn on_remove_subscription(
        &mut self,
        correlation_id: CorrelationId,
        registration_id: CorrelationId,
    ) -> Result<(), ConductorError> {
        let link = self
            .subscription_links
            .remove(&registration_id)
            .ok_or_else(|| ControlProtocolError::unknown_subscription(registration_id))?;
        self.close_subscription_link(link);
        self.client_proxy.on_operation_succeeded(correlation_id);
        Ok(())
    }

    /// Frees the link's positions and drops its stream reference, closing the
    /// endpoint once it serves no streams.
    fn close_subscription_link(&mut self, mut link: SubscriptionLink) {
        let registration_id = link.registration_id();
        for (connection_id, position) in link.drain_positions() {
            if let Some(connection) = self.connections.get_mut(&connection_id) {
                connection.remove_subscriber(registration_id);
            }
            self.free_position(&position);
        }

        let canonical = link.canonical();
        let stream_id = link.stream_id();
        let Some(endpoint) = self.receive_endpoints.get_mut(canonical) else {
            return;
        };
        let removed = if endpoint.dec_ref_to_stream(stream_id) == 0 {
            self.receiver_proxy.send(ReceiverCommand::RemoveSubscription {
                canonical: canonical.to_owned(),
                stream_id,
            })
        } else {
            Ok(())
        };
        let unused = endpoint.stream_count() == 0;
        if let Err(error) = removed {
            self.on_undelivered(&error);
        }
        self.events.log(
            EventCode::RemoveSubscriptionCleanup,
            format!("{canonical} {stream_id} {registration_id}"),
        );
        if unused {
            self.close_receive_endpoint(canonical);
        }
    }

    /// Removes the endpoint and waits, bounded, for the Receiver to confirm
    /// its socket is closed.
    fn close_receive_endpoint(&mut self, canonical: &str) {
        let Some(endpoint) = self.receive_endpoints.remove(canonical) else {
            return;
        };
        let closed = endpoint.close_flag();
        let queued = self
            .receiver_proxy
            .send(ReceiverCommand::CloseReceiveChannelEndpoint {
                canonical: canonical.to_owned(),
                closed: Arc::clone(&closed),
            })
            .is_ok();

        if queued && await_close(&closed, self.config.endpoint_close_timeout) {
            info!(channel = %canonical, "receive endpoint closed");
            return;
        }
        warn!(
            channel = %canonical,
            timeout_ms = self.config.endpoint_close_timeout.as_millis() as u64,
            "receive endpoint close not confirmed"
        );
        self.events
            .log(EventCode::EndpointCloseTimeout, canonical.to_owned());
        self.system_counters.endpoint_close_timeouts.increment();
    }

    fn close_send_endpoint_if_unused(&mut self, canonical: &str) {
        let unused = self
            .send_endpoints
            .get(canonical)
            .is_some_and(|endpoint| endpoint.publication_count() == 0);
        if unused && self.send_endpoints.remove(canonical).is_some() {
            let closed = self.sender_proxy.send(SenderCommand::CloseSendChannelEndpoint {
                canonical: canonical.to_owned(),
            });
            if let Err(error) = closed {
                self.on_undelivered(&error);
                return;
            }
            info!(channel = %canonical, "send endpoint closed");
        }
    }

    fn on_client_keepalive(&mut self, client_id: ClientId, now: NanoTime) {
        self.system_counters.client_keepalives.increment();
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.keepalive(now);
        }
    }

    // ---- receiver commands ----

    fn on_conductor_command(
        &mut self,
        command: ConductorCommand,
        now: NanoTime,
    ) -> Result<(), ConductorError> {
        match command {
            ConductorCommand::CreateConnection {
                canonical,
                session_id,
                stream_id,
                initial_term_id,
                active_term_id,
                term_offset,
                term_length,
                mtu_length,
                window_length,
                control_address,
                source_address,
            } => {
                if !is_valid_mtu(mtu_length) {
                    return Err(ControlProtocolError::invalid_channel(format!(
                        "sender mtu length {mtu_length} is not a valid frame size"
                    ))
                    .into());
                }
                if mtu_length > window_length {
                    return Err(ControlProtocolError::invalid_channel(format!(
                        "sender mtu length {mtu_length} greater than window length {window_length}"
                    ))
                    .into());
                }
                let rcvbuf = self.config.socket_rcvbuf_length;
                if window_length > rcvbuf {
                    return Err(ControlProtocolError::invalid_channel(format!(
                        "window length {window_length} greater than socket receive buffer {rcvbuf}"
                    ))
                    .into());
                }
                check_term_length(term_length)?;

                let Some(endpoint) = self.receive_endpoints.get(&canonical) else {
                    debug!(channel = %canonical, "no receive endpoint for new session");
                    return Ok(());
                };
                let exists = self
                    .connections
                    .values()
                    .any(|c| c.session_id() == session_id && c.matches(&canonical, stream_id));
                if exists {
                    return Ok(());
                }
                let channel_uri = endpoint.channel().uri().to_owned();

                let correlation_id = self.to_driver.next_correlation_id();
                let joining_position = compute_position(
                    active_term_id,
                    term_offset,
                    position_bits_to_shift(term_length),
                    initial_term_id,
                );
                let log = self.log_factory.new_connection(
                    LogIdentity {
                        canonical_channel: &canonical,
                        session_id,
                        stream_id,
                        correlation_id,
                    },
                    initial_term_id,
                    term_length,
                    mtu_length,
                )?;

                let mut allocated: Vec<Position> = Vec::new();
                let result = self.allocate_connection_positions(
                    &canonical,
                    session_id,
                    stream_id,
                    correlation_id,
                    joining_position,
                    &mut allocated,
                );
                let (hwm_position, subscriber_positions) = match result {
                    Ok(positions) => positions,
                    Err(error) => {
                        for position in &allocated {
                            self.free_position(position);
                        }
                        return Err(error);
                    }
                };
                let mut connection = NetworkConnection::new(
                    ConnectionParams {
                        correlation_id,
                        canonical,
                        channel_uri,
                        session_id,
                        stream_id,
                        log,
                        hwm_position,
                        subscriber_positions,
                        joining_position,
                        control_address,
                        source_address,
                    },
                    now,
                );
                let queued = self.receiver_proxy.send(ReceiverCommand::NewConnection {
                    connection: connection.handle(),
                });
                if let Err(error) = queued {
                    // The Receiver never saw the handle; it asks again on the next frame.
                    for position in connection.take_positions() {
                        self.free_position(&position);
                    }
                    return Err(error.into());
                }
                for (registration_id, position) in connection.subscriber_positions() {
                    if let Some(link) = self.subscription_links.get_mut(registration_id) {
                        link.add_position(correlation_id, position.clone());
                    }
                }
                self.system_counters.connections_created.increment();
                info!(
                    channel = %connection.canonical(),
                    session = %session_id,
                    stream = %stream_id,
                    joining_position,
                    subscribers = connection.subscriber_count(),
                    "connection created"
                );
                self.client_proxy.on_connection_ready(ConnectionReady {
                    channel: connection.channel_uri(),
                    stream_id,
                    session_id,
                    joining_position,
                    log: connection.log(),
                    correlation_id,
                    subscriber_positions: connection.subscriber_position_infos(),
                    source_info: source_address.source_info(),
                });
                self.connections.insert(correlation_id, connection);
                Ok(())
            }
        }
    }

    /// Allocates the high-water mark and one subscriber position per matching
    /// subscription. Every allocation is recorded in `allocated` so a failure
    /// can be unwound.
    fn allocate_connection_positions(
        &mut self,
        canonical: &str,
        session_id: SessionId,
        stream_id: StreamId,
        correlation_id: CorrelationId,
        joining_position: i64,
        allocated: &mut Vec<Position>,
    ) -> Result<(Position, Vec<(CorrelationId, Position)>), ConductorError> {
        let hwm = self.counters.new_position(position_label(
            "receiver hwm",
            canonical,
            session_id,
            stream_id,
            correlation_id,
        ))?;
        hwm.set_ordered(joining_position);
        allocated.push(hwm.clone());

        let mut subscribers = Vec::new();
        for link in self.subscription_links.values() {
            if !link.matches(canonical, stream_id) {
                continue;
            }
            let position = self.counters.new_position(position_label(
                "subscriber pos",
                canonical,
                session_id,
                stream_id,
                link.registration_id(),
            ))?;
            position.set_ordered(joining_position);
            allocated.push(position.clone());
            subscribers.push((link.registration_id(), position));
        }
        Ok((hwm, subscribers))
    }

    // ---- heartbeat sweep ----

    fn on_heartbeat_check(&mut self, now: NanoTime) {
        self.to_driver.set_consumer_heartbeat(now);
        self.check_clients(now);
        self.check_publication_links();
        self.check_publications(now);
        self.check_connections(now);
        self.check_subscription_links();

        if self
            .wheel
            .schedule_after(now, self.heartbeat_interval, ConductorTimer::HeartbeatCheck)
            .is_err()
        {
            warn!("timer wheel full, heartbeat sweep not rescheduled");
        }
    }

    fn check_clients(&mut self, now: NanoTime) {
        let timeout = self.client_liveness_timeout;
        let expired: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| client.has_timed_out(now, timeout))
            .map(AeronClient::client_id)
            .collect();
        for client_id in expired {
            self.clients.remove(&client_id);
            info!(client = %client_id, "client timed out");
        }
    }

    fn check_publication_links(&mut self) {
        let expired: Vec<CorrelationId> = self
            .publication_links
            .values()
            .filter(|link| !self.clients.contains_key(&link.client_id))
            .map(|link| link.registration_id)
            .collect();
        for registration_id in expired {
            if let Some(link) = self.publication_links.remove(&registration_id) {
                info!(
                    registration_id = %registration_id,
                    client = %link.client_id,
                    "publication link expired"
                );
                self.release_publication_link(&link);
            }
        }
    }

    fn check_publications(&mut self, now: NanoTime) {
        let linger = self.publication_linger;
        let removable: Vec<PublicationKey> = self
            .publications
            .iter_mut()
            .filter_map(|(key, publication)| {
                publication
                    .is_ready_for_removal(now, linger)
                    .then(|| key.clone())
            })
            .collect();
        for key in removable {
            self.remove_publication(&key);
        }
    }

    fn remove_publication(&mut self, key: &PublicationKey) {
        let Some(publication) = self.publications.remove(key) else {
            return;
        };
        self.close_publication(&publication);
        if let Some(endpoint) = self.send_endpoints.get_mut(&key.canonical) {
            endpoint.remove_publication(key.session_id, key.stream_id);
        }
        self.close_send_endpoint_if_unused(&key.canonical);

        self.events.log(
            EventCode::RemovePublicationCleanup,
            format!("{} {} {}", key.canonical, key.session_id, key.stream_id),
        );
        info!(
            channel = %key.canonical,
            session = %key.session_id,
            stream = %key.stream_id,
            "publication removed"
        );
    }

    fn check_connections(&mut self, now: NanoTime) {
        let timeout = self.connection_liveness_timeout;
        let mut removable = Vec::new();

        for connection in self.connections.values_mut() {
            if connection.status() == ConnectionStatus::Active
                && (connection.is_drained() || connection.is_stalled(now, timeout))
            {
                connection.set_status(ConnectionStatus::Inactive, now);
                debug!(connection = %connection.correlation_id(), "connection inactive");
            }

            match connection.status() {
                ConnectionStatus::Active => {}
                ConnectionStatus::Inactive => {
                    self.client_proxy.on_inactive_connection(
                        connection.correlation_id(),
                        connection.session_id(),
                        connection.stream_id(),
                        connection.rebuild_position(),
                        connection.channel_uri(),
                    );
                    connection.set_status(ConnectionStatus::Linger, now);
                }
                ConnectionStatus::Linger => {
                    if now > connection.time_of_last_status_change() + timeout {
                        removable.push(connection.correlation_id());
                    }
                }
            }
        }

        for correlation_id in removable {
            self.remove_connection(correlation_id);
        }
    }

    fn remove_connection(&mut self, correlation_id: CorrelationId) {
        let Some(mut connection) = self.connections.remove(&correlation_id) else {
            return;
        };
        for link in self.subscription_links.values_mut() {
            link.remove_position(correlation_id);
        }
        let released = Arc::new(AtomicBool::new(false));
        let removed = self.receiver_proxy.send(ReceiverCommand::RemoveConnection {
            canonical: connection.canonical().to_owned(),
            session_id: connection.session_id(),
            stream_id: connection.stream_id(),
            released: Arc::clone(&released),
        });
        if let Err(error) = removed {
            self.on_undelivered(&error);
        }
        self.retire_positions(released, connection.take_positions());
        self.events.log(
            EventCode::RemoveConnectionCleanup,
            format!(
                "{} {} {}",
                connection.canonical(),
                connection.session_id(),
                connection.stream_id()
            ),
        );
        info!(connection = %correlation_id, "connection removed");
    }

    fn check_subscription_links(&mut self) {
        let expired: Vec<CorrelationId> = self
            .subscription_links
            .values()
            .filter(|link| !self.clients.contains_key(&link.client_id()))
            .map(SubscriptionLink::registration_id)
            .collect();
        for registration_id in expired {
            if let Some(link) = self.subscription_links.remove(&registration_id) {
                info!(
                    registration_id = %registration_id,
                    client = %link.client_id(),
                    "subscription link expired"
                );
                self.close_subscription_link(link);
            }
        }
    }

    fn free_position(&mut self, position: &Position) {
        if let Err(_e) = self.counters.free(position.id()) {
            warn!(counter = %position.id(), error = %_e, "failed to free position");
        }
    }

    /// Tells the Sender to drop a publication and retires its counters until it has.
    fn close_publication(&mut self, publication: &NetworkPublication) {
        let key = publication.key();
        let released = Arc::new(AtomicBool::new(false));
        let closed = self.sender_proxy.send(SenderCommand::ClosePublication {
            canonical: key.canonical.clone(),
            session_id: key.session_id,
            stream_id: key.stream_id,
            released: Arc::clone(&released),
        });
        if let Err(error) = closed {
            self.on_undelivered(&error);
        }
        self.retire_positions(
            released,
            vec![
                publication.sender_position().clone(),
                publication.publisher_limit().clone(),
            ],
        );
    }

    /// An undelivered close stays retired for good: its agent may still be writing.
    fn retire_positions(&mut self, released: Arc<AtomicBool>, positions: Vec<Position>) {
        self.retired.push(RetiredPositions {
            released,
            positions,
        });
    }

    /// Frees the counters of every retired entity whose agent has let go.
    fn free_released_positions(&mut self) -> usize {
        let mut freed = 0;
        let mut index = 0;
        while index < self.retired.len() {
            if !self.retired[index].released.load(Ordering::Acquire) {
                index += 1;
                continue;
            }
            let retired = self.retired.swap_remove(index);
            for position in &retired.positions {
                self.free_position(position);
            }
            freed += retired.positions.len();
        }
        freed
    }

    /// Teardown commands cannot be taken back once the client has its answer,
    /// so an undelivered one is only recorded.
    fn on_undelivered(&self, error: &QueueFull) {
        self.events.log(EventCode::Exception, error.to_string());
        self.system_counters.errors.increment();
    }

    // ---- introspection ----

    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    #[must_use]
    pub fn publication_link_count(&self) -> usize {
        self.publication_links.len()
    }

    #[must_use]
    pub fn subscription_link_count(&self) -> usize {
        self.subscription_links.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Counters of removed entities still waiting for their agent to let go.
    #[must_use]
    pub fn retired_position_count(&self) -> usize {
        self.retired.iter().map(|r| r.positions.len()).sum()
    }

    /// Reference count of the publication for `(channel, session, stream)`.
    #[must_use]
    pub fn publication_ref_count(
        &self,
        channel: &str,
        session_id: SessionId,
        stream_id: StreamId,
    ) -> Option<usize> {
        let canonical = UdpChannel::parse(channel).ok()?.canonical_form().to_owned();
        self.publications
            .get(&PublicationKey {
                canonical,
                session_id,
                stream_id,
            })
            .map(NetworkPublication::ref_count)
    }

    /// Sender position of the publication for `(channel, session, stream)`.
    #[must_use]
    pub fn sender_position(
        &self,
        channel: &str,
        session_id: SessionId,
        stream_id: StreamId,
    ) -> Option<Position> {
        let canonical = UdpChannel::parse(channel).ok()?.canonical_form().to_owned();
        self.publications
            .get(&PublicationKey {
                canonical,
                session_id,
                stream_id,
            })
            .map(|publication| publication.sender_position().clone())
    }

    #[must_use]
    pub fn connection_status(&self, correlation_id: CorrelationId) -> Option<ConnectionStatus> {
        self.connections
            .get(&correlation_id)
            .map(NetworkConnection::status)
    }

    /// Receiver-written activity of a connection.
    #[must_use]
    pub fn connection_activity(
        &self,
        correlation_id: CorrelationId,
    ) -> Option<Arc<super::connection::ConnectionActivity>> {
        self.connections
            .get(&correlation_id)
            .map(|connection| Arc::clone(connection.activity()))
    }

    #[must_use]
    pub fn has_send_endpoint(&self, channel: &str) -> bool {
        UdpChannel::parse(channel)
            .is_ok_and(|udp| self.send_endpoints.contains(udp.canonical_form()))
    }

    #[must_use]
    pub fn has_receive_endpoint(&self, channel: &str) -> bool {
        UdpChannel::parse(channel)
            .is_ok_and(|udp| self.receive_endpoints.contains(udp.canonical_form()))
    }

    #[must_use]
    pub const fn counters(&self) -> &CountersManager {
        &self.counters
    }

    #[must_use]
    pub const fn system_counters(&self) -> &SystemCounters {
        &self.system_counters
    }

    /// Earliest pending conductor timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<NanoTime> {
        self.wheel.next_deadline()
    }

    fn close_all(&mut self) {
        let keys: Vec<PublicationKey> = self.publications.keys().cloned().collect();
        for key in keys {
            if let Some(publication) = self.publications.remove(&key) {
                self.close_publication(&publication);
            }
        }
        let endpoints: Vec<String> = self
            .send_endpoints
            .drain()
            .map(|(canonical, _)| canonical)
            .collect();
        for canonical in endpoints {
            if let Err(error) = self
                .sender_proxy
                .send(SenderCommand::CloseSendChannelEndpoint { canonical })
            {
                self.on_undelivered(&error);
            }
        }

        let ids: Vec<CorrelationId> = self.connections.keys().copied().collect();
        for correlation_id in ids {
            self.remove_connection(correlation_id);
        }
        self.subscription_links.clear();
        let endpoints: Vec<_> = self.receive_endpoints.drain().collect();
        for (canonical, endpoint) in endpoints {
            if let Err(error) = self
                .receiver_proxy
                .send(ReceiverCommand::CloseReceiveChannelEndpoint {
                    canonical,
                    closed: endpoint.close_flag(),
                })
            {
                self.on_undelivered(&error);
            }
        }
        self.free_released_positions();

        self.publication_links.clear();
        self.clients.clear();
        self.log_factory.close();
    }
}

impl Agent for DriverConductor {
    fn role_name(&self) -> &'static str {
        "conductor"
    }

    fn do_work(&mut self) -> usize {
        Self::do_work(self)
    }

    fn on_close(&mut self) {
        self.close_all();
        info!("conductor closed");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::control::types::{DriverResponse, ErrorCode};
    use crate::control::{ResponseConsumer, msg_type};
    use crate::runtime::driver::context::DriverQueues;
    use crate::runtime::timing::ManualClock;

    const CHANNEL: &str = "udp://127.0.0.1:40123";

    fn config() -> DriverConfig {
        DriverConfig::default()
            .with_term_buffer_length(64 * 1024)
            .with_endpoint_close_timeout(Duration::from_millis(10))
    }

    fn conductor() -> (DriverConductor, DriverQueues, ManualClock) {
        let clock = ManualClock::new(NanoTime::new(1_000_000));
        let (ctx, queues) = ConductorContext::new(config(), Arc::new(clock.clone())).unwrap();
        (DriverConductor::new(ctx).unwrap(), queues, clock)
    }

    fn responses(consumer: &ResponseConsumer) -> Vec<DriverResponse> {
        let mut out = Vec::new();
        consumer.drain(usize::MAX, |r| out.push(r));
        out
    }

    #[test]
    fn unknown_command_type_is_ignored() {
        let (mut conductor, queues, _) = conductor();
        let client = queues.to_driver.client(ClientId(1));
        client
            .submit_raw(CommandFrame {
                msg_type_id: 0x7f,
                payload: vec![1, 2, 3],
            })
            .unwrap();
        assert_eq!(conductor.do_work(), 1);
        assert!(responses(&queues.responses).is_empty());
        assert_eq!(conductor.system_counters().errors.get(), 0);
    }

    #[test]
    fn truncated_command_gets_generic_error() {
        let (mut conductor, queues, _) = conductor();
        let client = queues.to_driver.client(ClientId(1));
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i64.to_le_bytes());
        payload.extend_from_slice(&77i64.to_le_bytes());
        client
            .submit_raw(CommandFrame {
                msg_type_id: msg_type::ADD_PUBLICATION,
                payload,
            })
            .unwrap();
        conductor.do_work();

        match responses(&queues.responses).as_slice() {
            [DriverResponse::Error {
                code,
                offending_correlation_id,
                offending_length,
                offending_msg_type_id,
                ..
            }] => {
                assert_eq!(*code, ErrorCode::GenericError);
                assert_eq!(*offending_correlation_id, Some(CorrelationId(77)));
                assert_eq!(*offending_length, 16);
                assert_eq!(*offending_msg_type_id, msg_type::ADD_PUBLICATION);
            }
            other => panic!("unexpected responses {other:?}"),
        }
        assert_eq!(conductor.system_counters().errors.get(), 1);
    }

    #[test]
    fn invalid_channel_is_reported() {
        let (mut conductor, queues, _) = conductor();
        let mut client = queues.to_driver.client(ClientId(1));
        client
            .add_publication("tcp://127.0.0.1:40123", SessionId(1), StreamId(1))
            .unwrap();
        conductor.do_work();

        assert!(matches!(
            responses(&queues.responses).as_slice(),
            [DriverResponse::Error { code: ErrorCode::InvalidChannel, .. }]
        ));
        assert_eq!(conductor.publication_count(), 0);
        assert!(!conductor.has_send_endpoint("udp://127.0.0.1:40123"));
    }

    #[test]
    fn mtu_above_send_buffer_rejects_endpoint() {
        let clock = ManualClock::new(NanoTime::new(0));
        let config = config().with_mtu_length(8192).with_socket_buffers(4096, 4096);
        let (ctx, queues) = ConductorContext::new(config, Arc::new(clock)).unwrap();
        let mut conductor = DriverConductor::new(ctx).unwrap();

        let mut client = queues.to_driver.client(ClientId(1));
        client.add_publication(CHANNEL, SessionId(1), StreamId(1)).unwrap();
        conductor.do_work();

        assert!(matches!(
            responses(&queues.responses).as_slice(),
            [DriverResponse::Error { code: ErrorCode::InvalidChannel, .. }]
        ));
        assert!(!conductor.has_send_endpoint(CHANNEL));
        assert!(queues.sender_commands.pop().is_none());
    }

    #[test]
    fn new_publication_reaches_sender() {
        let (mut conductor, queues, _) = conductor();
        let mut client = queues.to_driver.client(ClientId(1));
        client.add_publication(CHANNEL, SessionId(42), StreamId(7)).unwrap();
        conductor.do_work();

        assert!(matches!(
            queues.sender_commands.pop(),
            Some(SenderCommand::RegisterSendChannelEndpoint { .. })
        ));
        match queues.sender_commands.pop() {
            Some(SenderCommand::NewPublication { publication, .. }) => {
                assert_eq!(publication.key.session_id, SessionId(42));
                assert_eq!(publication.key.stream_id, StreamId(7));
                assert_eq!(publication.publisher_limit.get(), 32 * 1024);
            }
            _ => panic!("expected NewPublication"),
        }
        assert_eq!(conductor.system_counters().publications_created.get(), 1);
    }

    #[test]
    fn heartbeat_publishes_consumer_liveness() {
        let (mut conductor, queues, clock) = conductor();
        let client = queues.to_driver.client(ClientId(1));
        assert_eq!(client.consumer_heartbeat(), NanoTime::new(1_000_000));

        clock.advance(NanoDuration::from_millis(1_000));
        assert_eq!(conductor.do_work(), 1);
        assert_eq!(client.consumer_heartbeat(), clock.now());
        assert!(conductor.next_deadline().is_some());
    }

    #[test]
    fn keepalive_for_unknown_client_is_counted_only() {
        let (mut conductor, queues, _) = conductor();
        let mut client = queues.to_driver.client(ClientId(9));
        client.send_keepalive().unwrap();
        conductor.do_work();
        assert_eq!(conductor.client_count(), 0);
        assert_eq!(conductor.system_counters().client_keepalives.get(), 1);
    }

    #[test]
    fn events_reach_the_consumer() {
        let clock = ManualClock::new(NanoTime::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (ctx, queues) = ConductorContext::new(config(), Arc::new(clock)).unwrap();
        let ctx = ctx.with_event_consumer(Box::new(move |event| {
            sink.lock().unwrap().push(event.code);
        }));
        let mut conductor = DriverConductor::new(ctx).unwrap();

        let mut client = queues.to_driver.client(ClientId(1));
        client.add_publication(CHANNEL, SessionId(1), StreamId(1)).unwrap();
        conductor.do_work();
        conductor.do_work();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[EventCode::CmdInAddPublication, EventCode::ChannelCreated]
        );
    }
}
