//! Driver configuration.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::descriptor::{
    FRAME_ALIGNMENT, HEADER_LENGTH, MAX_UDP_PAYLOAD_LENGTH, check_term_length,
};
use crate::runtime::agent::IdleStrategy;
use crate::runtime::topology::CpuConfig;

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("mtu {0} must be a multiple of 32 between the 32 byte header and 65504")]
    InvalidMtu(usize),
    #[error("term buffer length {0} must be a power of two between 64 KiB and 1 GiB")]
    InvalidTermLength(usize),
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("{name} {value} must be within [0, 1]")]
    InvalidRate { name: &'static str, value: f64 },
    #[error("timer wheel slots {0} must be a power of two")]
    WheelSlots(usize),
}

/// `true` for an MTU the driver can frame: header-sized or more, aligned, and
/// within one UDP payload.
#[must_use]
pub const fn is_valid_mtu(mtu: usize) -> bool {
    mtu >= HEADER_LENGTH && mtu <= MAX_UDP_PAYLOAD_LENGTH && mtu % FRAME_ALIGNMENT == 0
}

/// Configuration for the conductor and the agents it launches.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// MTU for publications created by this driver.
    pub mtu_length: usize,
    /// Term length for publication logs. Connection logs use the sender's.
    pub term_buffer_length: usize,
    /// Receiver window advertised to senders.
    pub initial_window_length: usize,
    pub socket_sndbuf_length: usize,
    pub socket_rcvbuf_length: usize,
    /// Period of the liveness sweep.
    pub heartbeat_interval: Duration,
    pub client_liveness_timeout: Duration,
    pub connection_liveness_timeout: Duration,
    /// How long a flushed, unreferenced publication lingers before removal.
    pub publication_linger: Duration,
    /// Upper bound on the wait for the Receiver to confirm an endpoint close.
    pub endpoint_close_timeout: Duration,
    /// How long the conductor keeps offering a command to a full Sender or
    /// Receiver queue before giving up on it.
    pub command_offer_timeout: Duration,
    pub timer_tick: Duration,
    pub timer_wheel_slots: usize,
    /// Events drained from the event log per duty cycle.
    pub event_reader_frame_limit: usize,
    pub counters_capacity: usize,
    pub data_loss_rate: f64,
    /// `-1` seeds from entropy.
    pub data_loss_seed: i64,
    pub control_loss_rate: f64,
    pub control_loss_seed: i64,
    pub retransmit_delay: Duration,
    pub retransmit_linger: Duration,
    pub cpu: CpuConfig,
    pub idle_strategy: IdleStrategy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mtu_length: 4096,
            term_buffer_length: 16 * 1024 * 1024,
            initial_window_length: 128 * 1024,
            socket_sndbuf_length: 128 * 1024,
            socket_rcvbuf_length: 128 * 1024,
            heartbeat_interval: Duration::from_secs(1),
            client_liveness_timeout: Duration::from_secs(5),
            connection_liveness_timeout: Duration::from_secs(10),
            publication_linger: Duration::from_secs(5),
            endpoint_close_timeout: Duration::from_secs(5),
            command_offer_timeout: Duration::from_secs(1),
            timer_tick: Duration::from_millis(1),
            timer_wheel_slots: 1024,
            event_reader_frame_limit: 8,
            counters_capacity: 1024,
            data_loss_rate: 0.0,
            data_loss_seed: -1,
            control_loss_rate: 0.0,
            control_loss_seed: -1,
            retransmit_delay: Duration::ZERO,
            retransmit_linger: Duration::from_millis(60),
            cpu: CpuConfig::Auto,
            idle_strategy: IdleStrategy::default(),
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub const fn with_mtu_length(mut self, mtu: usize) -> Self {
        self.mtu_length = mtu;
        self
    }

    #[must_use]
    pub const fn with_term_buffer_length(mut self, length: usize) -> Self {
        self.term_buffer_length = length;
        self
    }

    #[must_use]
    pub const fn with_initial_window_length(mut self, length: usize) -> Self {
        self.initial_window_length = length;
        self
    }

    #[must_use]
    pub const fn with_socket_buffers(mut self, sndbuf: usize, rcvbuf: usize) -> Self {
        self.socket_sndbuf_length = sndbuf;
        self.socket_rcvbuf_length = rcvbuf;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_client_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.client_liveness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_connection_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.connection_liveness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_publication_linger(mut self, linger: Duration) -> Self {
        self.publication_linger = linger;
        self
    }

    #[must_use]
    pub const fn with_endpoint_close_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_close_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_command_offer_timeout(mut self, timeout: Duration) -> Self {
        self.command_offer_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick;
        self
    }

    #[must_use]
    pub const fn with_event_reader_frame_limit(mut self, limit: usize) -> Self {
        self.event_reader_frame_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_counters_capacity(mut self, capacity: usize) -> Self {
        self.counters_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_data_loss(mut self, rate: f64, seed: i64) -> Self {
        self.data_loss_rate = rate;
        self.data_loss_seed = seed;
        self
    }

    #[must_use]
    pub const fn with_control_loss(mut self, rate: f64, seed: i64) -> Self {
        self.control_loss_rate = rate;
        self.control_loss_seed = seed;
        self
    }

    #[must_use]
    pub const fn with_retransmit(mut self, delay: Duration, linger: Duration) -> Self {
        self.retransmit_delay = delay;
        self.retransmit_linger = linger;
        self
    }

    #[must_use]
    pub fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }

    #[must_use]
    pub const fn with_idle_strategy(mut self, idle: IdleStrategy) -> Self {
        self.idle_strategy = idle;
        self
    }

    /// Checks every field the conductor relies on.
    ///
    /// # Errors
    /// The first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_mtu(self.mtu_length) {
            return Err(ConfigError::InvalidMtu(self.mtu_length));
        }
        check_term_length(self.term_buffer_length)
            .map_err(|_| ConfigError::InvalidTermLength(self.term_buffer_length))?;
        if !self.timer_wheel_slots.is_power_of_two() {
            return Err(ConfigError::WheelSlots(self.timer_wheel_slots));
        }

        let non_zero = [
            ("initial_window_length", self.initial_window_length == 0),
            ("socket_sndbuf_length", self.socket_sndbuf_length == 0),
            ("socket_rcvbuf_length", self.socket_rcvbuf_length == 0),
            ("heartbeat_interval", self.heartbeat_interval.is_zero()),
            ("client_liveness_timeout", self.client_liveness_timeout.is_zero()),
            (
                "connection_liveness_timeout",
                self.connection_liveness_timeout.is_zero(),
            ),
            ("timer_tick", self.timer_tick.is_zero()),
            ("event_reader_frame_limit", self.event_reader_frame_limit == 0),
            ("counters_capacity", self.counters_capacity == 0),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero { name });
        }

        for (name, value) in [
            ("data_loss_rate", self.data_loss_rate),
            ("control_loss_rate", self.control_loss_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRate { name, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(DriverConfig::default().validate(), Ok(()));
    }

    #[test]
    fn mtu_bounds() {
        assert!(is_valid_mtu(HEADER_LENGTH));
        assert!(is_valid_mtu(MAX_UDP_PAYLOAD_LENGTH));
        assert!(!is_valid_mtu(0));
        assert!(!is_valid_mtu(1500));
        assert!(!is_valid_mtu(MAX_UDP_PAYLOAD_LENGTH + FRAME_ALIGNMENT));

        let config = DriverConfig::default().with_mtu_length(1500);
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu(1500)));
    }

    #[test]
    fn rejects_bad_term_length() {
        let config = DriverConfig::default().with_term_buffer_length(100_000);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTermLength(100_000))
        );
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = DriverConfig::default().with_heartbeat_interval(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                name: "heartbeat_interval"
            })
        );
    }

    #[test]
    fn rejects_out_of_range_loss_rate() {
        let config = DriverConfig::default().with_data_loss(1.5, 7);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRate {
                name: "data_loss_rate",
                ..
            })
        ));
    }
}
