//! Sender-side flow control: how far a publication may run ahead of its receivers.

use std::collections::HashMap;

use crate::buffer::descriptor::{compute_position, position_bits_to_shift};
use crate::net::Endpoint;

/// Computes a publication's sender position limit from receiver status messages.
///
/// One instance per publication, owned by the Sender.
pub trait FlowControl: Send {
    /// Limit before any status message has arrived.
    fn initial_position_limit(&mut self, initial_term_id: i32, term_length: usize) -> i64;

    /// Folds in a status message and returns the new limit.
    fn on_status_message(
        &mut self,
        term_id: i32,
        term_offset: i32,
        receiver_window: i32,
        receiver: Endpoint,
    ) -> i64;
}

/// Picks the strategy by channel kind.
#[must_use]
pub fn for_channel(multicast: bool) -> Box<dyn FlowControl> {
    if multicast {
        Box::new(MaxMulticastFlowControl::default())
    } else {
        Box::new(UnicastFlowControl::default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Geometry {
    initial_term_id: i32,
    bits: u32,
}

impl Geometry {
    const fn new(initial_term_id: i32, term_length: usize) -> Self {
        Self {
            initial_term_id,
            bits: position_bits_to_shift(term_length),
        }
    }

    const fn limit(self, term_id: i32, term_offset: i32, window: i32) -> i64 {
        compute_position(term_id, term_offset, self.bits, self.initial_term_id) + window as i64
    }
}

/// Tracks the single receiver of a unicast channel. The limit never regresses.
#[derive(Debug, Default)]
pub struct UnicastFlowControl {
    geometry: Geometry,
    position_limit: i64,
}

impl FlowControl for UnicastFlowControl {
    fn initial_position_limit(&mut self, initial_term_id: i32, term_length: usize) -> i64 {
        self.geometry = Geometry::new(initial_term_id, term_length);
        self.position_limit = 0;
        self.position_limit
    }

    fn on_status_message(
        &mut self,
        term_id: i32,
        term_offset: i32,
        receiver_window: i32,
        _receiver: Endpoint,
    ) -> i64 {
        let limit = self.geometry.limit(term_id, term_offset, receiver_window);
        self.position_limit = self.position_limit.max(limit);
        self.position_limit
    }
}

/// Paces a multicast publication by its fastest receiver.
#[derive(Debug, Default)]
pub struct MaxMulticastFlowControl {
    geometry: Geometry,
    receivers: HashMap<Endpoint, i64>,
    position_limit: i64,
}

impl FlowControl for MaxMulticastFlowControl {
    fn initial_position_limit(&mut self, initial_term_id: i32, term_length: usize) -> i64 {
        self.geometry = Geometry::new(initial_term_id, term_length);
        self.receivers.clear();
        self.position_limit = 0;
        self.position_limit
    }

    fn on_status_message(
        &mut self,
        term_id: i32,
        term_offset: i32,
        receiver_window: i32,
        receiver: Endpoint,
    ) -> i64 {
        let limit = self.geometry.limit(term_id, term_offset, receiver_window);
        let entry = self.receivers.entry(receiver).or_insert(limit);
        *entry = (*entry).max(limit);
        self.position_limit = self.position_limit.max(*entry);
        self.position_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM: usize = 64 * 1024;

    #[test]
    fn unicast_follows_receiver_and_never_regresses() {
        let mut fc = UnicastFlowControl::default();
        let rx = Endpoint::localhost(1);
        assert_eq!(fc.initial_position_limit(10, TERM), 0);
        assert_eq!(fc.on_status_message(10, 1024, 4096, rx), 5120);
        assert_eq!(fc.on_status_message(11, 0, 4096, rx), TERM as i64 + 4096);
        assert_eq!(fc.on_status_message(10, 0, 4096, rx), TERM as i64 + 4096);
    }

    #[test]
    fn multicast_takes_fastest_receiver() {
        let mut fc = MaxMulticastFlowControl::default();
        fc.initial_position_limit(0, TERM);
        let slow = Endpoint::new_v4(10, 0, 0, 1, 1);
        let fast = Endpoint::new_v4(10, 0, 0, 2, 1);
        assert_eq!(fc.on_status_message(0, 1024, 1024, slow), 2048);
        assert_eq!(fc.on_status_message(0, 8192, 1024, fast), 9216);
        assert_eq!(fc.on_status_message(0, 2048, 1024, slow), 9216);
    }

    #[test]
    fn strategy_chosen_by_channel_kind() {
        let mut unicast = for_channel(false);
        let mut multicast = for_channel(true);
        assert_eq!(unicast.initial_position_limit(0, TERM), 0);
        assert_eq!(multicast.initial_position_limit(0, TERM), 0);
    }
}
