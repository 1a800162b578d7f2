use std::collections::HashMap;

use crate::control::types::{ClientId, CorrelationId, StreamId};
use crate::counters::Position;

/// A client's registration for a stream on a receive endpoint. Holds one
/// subscriber position per connection it is attached to, keyed by the
/// connection's correlation id.
#[derive(Debug)]
pub struct SubscriptionLink {
    registration_id: CorrelationId,
    client_id: ClientId,
    canonical: String,
    channel_uri: String,
    stream_id: StreamId,
    positions: HashMap<CorrelationId, Position>,
}

impl SubscriptionLink {
    #[must_use]
    pub fn new(
        registration_id: CorrelationId,
        client_id: ClientId,
        canonical: String,
        channel_uri: String,
        stream_id: StreamId,
    ) -> Self {
        Self {
            registration_id,
            client_id,
            canonical,
            channel_uri,
            stream_id,
            positions: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn registration_id(&self) -> CorrelationId {
        self.registration_id
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub fn channel_uri(&self) -> &str {
        &self.channel_uri
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn matches(&self, canonical: &str, stream_id: StreamId) -> bool {
        self.stream_id == stream_id && self.canonical == canonical
    }

    pub fn add_position(&mut self, connection_id: CorrelationId, position: Position) {
        self.positions.insert(connection_id, position);
    }

    pub fn remove_position(&mut self, connection_id: CorrelationId) -> Option<Position> {
        self.positions.remove(&connection_id)
    }

    /// Detaches the link from every connection.
    pub fn drain_positions(&mut self) -> impl Iterator<Item = (CorrelationId, Position)> + '_ {
        self.positions.drain()
    }

    /// Connections this link is attached to.
    pub fn connections(&self) -> impl Iterator<Item = CorrelationId> + '_ {
        self.positions.keys().copied()
    }

    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CountersManager;

    #[test]
    fn tracks_positions_per_connection() {
        let mut counters = CountersManager::new(4);
        let mut link = SubscriptionLink::new(
            CorrelationId(3),
            ClientId(1),
            "UDP-00000000-0-7f000001-40123".into(),
            "udp://127.0.0.1:40123".into(),
            StreamId(10),
        );
        assert!(link.matches("UDP-00000000-0-7f000001-40123", StreamId(10)));
        assert!(!link.matches("UDP-00000000-0-7f000001-40123", StreamId(11)));

        let position = counters.new_position("subscriber pos").unwrap();
        link.add_position(CorrelationId(50), position.clone());
        assert_eq!(link.connections().collect::<Vec<_>>(), vec![CorrelationId(50)]);
        assert_eq!(
            link.remove_position(CorrelationId(50)).map(|p| p.id()),
            Some(position.id())
        );
        assert_eq!(link.position_count(), 0);
    }
}
