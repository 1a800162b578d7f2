//! The media driver: a conductor plus Sender and Receiver agents on their own threads.
//!
//! # Architecture
//!
//! ```text
//!   clients ──ToDriverBuffer (MPSC)──▶ Conductor ──ClientProxy (SPSC)──▶ clients
//!                                       │    ▲
//!                     SenderCommand ◀───┘    └─── ConductorCommand (new session)
//!                     ReceiverCommand ◀──────────────┐
//!                                                     │
//!                        Sender                    Receiver
//! ```
//!
//! The conductor owns every channel endpoint, publication, subscription and
//! connection. The Sender and Receiver only see the handles it sends them and
//! the position counters they write. No maps are shared; every decision flows
//! through the command queues in [`commands`].
//!
//! Frame I/O lives in the Sender and Receiver, which callers supply as
//! [`Agent`]s built from [`SenderQueues`] and [`ReceiverQueues`].

pub mod client;
pub mod commands;
pub mod conductor;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod flow_control;
pub mod loss;
pub mod proxy;
pub mod publication;
pub mod retransmit;
pub mod subscription;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::control::types::ClientId;
use crate::control::{DriverProxy, ResponseConsumer, ToDriverHandle};
use crate::counters::CountersReader;
use crate::events::EventLogger;
use crate::runtime::agent::{Agent, AgentRunner, IdleStrategy};
use crate::runtime::timing::NanoClock;
use crate::runtime::topology::{AgentRole, pin_to_core};
use crate::trace::{debug, error, info, warn};

pub use conductor::DriverConductor;
pub use config::{ConfigError, DriverConfig};
pub use connection::{ConnectionActivity, ConnectionStatus};
pub use context::{ConductorContext, DriverQueues};
pub use error::{ConductorError, ControlProtocolError};
pub use proxy::{ConductorCommandQueue, ConductorProxy, ReceiverCommandQueue, SenderCommandQueue};

/// What a Sender agent is built from.
pub struct SenderQueues {
    pub commands: SenderCommandQueue,
}

/// What a Receiver agent is built from.
pub struct ReceiverQueues {
    pub commands: ReceiverCommandQueue,
    pub conductor: ConductorProxy,
}

/// Error launching the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("conductor: {0}")]
    Conductor(#[from] ConductorError),
    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: &'static str,
        source: std::io::Error,
    },
}

/// Handle to a running driver.
///
/// Dropping the handle signals shutdown but does not wait for the threads.
/// Use [`MediaDriver::shutdown`] to join them.
pub struct MediaDriver {
    running: Arc<AtomicBool>,
    to_driver: ToDriverHandle,
    responses: ResponseConsumer,
    counters: CountersReader,
    events: EventLogger,
    threads: Vec<(AgentRole, JoinHandle<()>)>,
}

impl MediaDriver {
    /// Builds the conductor and the caller's agents, then starts one thread per agent.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, a counters region too small for the
    /// system counters, or a thread that cannot be spawned. Threads already
    /// started are stopped and joined before returning.
    pub fn launch<S, R>(
        config: DriverConfig,
        clock: Arc<dyn NanoClock>,
        sender: impl FnOnce(SenderQueues) -> S,
        receiver: impl FnOnce(ReceiverQueues) -> R,
    ) -> Result<Self, DriverError>
    where
        S: Agent + 'static,
        R: Agent + 'static,
    {
        let placement = config.cpu.resolve();
        let idle = config.idle_strategy;
        info!(
            strategy = %placement.strategy,
            mtu = config.mtu_length,
            term_length = config.term_buffer_length,
            "media driver starting"
        );

        let (ctx, queues) = ConductorContext::new(config, clock)?;
        let DriverQueues {
            sender_commands,
            receiver_commands,
            conductor,
            responses,
            to_driver,
            counters,
            events,
        } = queues;
        let conductor_agent = DriverConductor::new(ctx)?;
        let sender_agent = sender(SenderQueues {
            commands: sender_commands,
        });
        let receiver_agent = receiver(ReceiverQueues {
            commands: receiver_commands,
            conductor,
        });

        let mut driver = Self {
            running: Arc::new(AtomicBool::new(true)),
            to_driver,
            responses,
            counters,
            events,
            threads: Vec::with_capacity(3),
        };

        let spawned = driver
            .spawn(AgentRole::Receiver, receiver_agent, idle, placement.core_for(AgentRole::Receiver))
            .and_then(|()| {
                driver.spawn(AgentRole::Sender, sender_agent, idle, placement.core_for(AgentRole::Sender))
            })
            .and_then(|()| {
                driver.spawn(
                    AgentRole::Conductor,
                    conductor_agent,
                    idle,
                    placement.core_for(AgentRole::Conductor),
                )
            });
        if let Err(error) = spawned {
            driver.stop_and_join();
            return Err(error);
        }

        info!("media driver started");
        Ok(driver)
    }

    fn spawn<A: Agent + 'static>(
        &mut self,
        role: AgentRole,
        agent: A,
        idle: IdleStrategy,
        core: Option<usize>,
    ) -> Result<(), DriverError> {
        let running = Arc::clone(&self.running);
        let thread = role.thread_name();
        debug!(thread, core = ?core, "spawning agent thread");
        let handle = thread::Builder::new()
            .name(thread.into())
            .spawn(move || {
                if let Some(core) = core
                    && !pin_to_core(core)
                {
                    warn!(thread, core, "failed to pin thread, running unpinned");
                }
                AgentRunner::new(agent, idle, running).run();
            })
            .map_err(|source| DriverError::Spawn { thread, source })?;
        self.threads.push((role, handle));
        Ok(())
    }

    /// A new client writing into the command buffer.
    #[must_use]
    pub fn client(&self, client_id: ClientId) -> DriverProxy {
        self.to_driver.client(client_id)
    }

    /// Attaches clients from other threads.
    #[must_use]
    pub fn to_driver(&self) -> ToDriverHandle {
        self.to_driver.clone()
    }

    /// Replies and notifications for clients.
    #[must_use]
    pub const fn responses(&self) -> &ResponseConsumer {
        &self.responses
    }

    #[must_use]
    pub const fn counters(&self) -> &CountersReader {
        &self.counters
    }

    #[must_use]
    pub const fn events(&self) -> &EventLogger {
        &self.events
    }

    /// Returns a clone of the running flag for external signal handling.
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stops every agent and waits for its thread. The conductor is joined
    /// first so its close commands reach the Sender and Receiver.
    pub fn shutdown(mut self) {
        info!("media driver shutdown initiated");
        self.stop_and_join();
        info!("media driver shutdown complete");
    }

    fn stop_and_join(&mut self) {
        self.running.store(false, Ordering::Release);
        self.threads
            .sort_by_key(|(role, _)| *role != AgentRole::Conductor);
        for (role, handle) in self.threads.drain(..) {
            debug!(thread = role.thread_name(), "waiting for agent thread");
            if handle.join().is_err() {
                error!(thread = role.thread_name(), "agent thread panicked");
            }
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
