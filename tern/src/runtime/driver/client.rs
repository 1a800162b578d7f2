use crate::control::types::ClientId;
use crate::runtime::timing::{NanoDuration, NanoTime};

/// Liveness record of one client process.
#[derive(Debug, Clone, Copy)]
pub struct AeronClient {
    client_id: ClientId,
    time_of_last_keepalive: NanoTime,
}

impl AeronClient {
    #[must_use]
    pub const fn new(client_id: ClientId, now: NanoTime) -> Self {
        Self {
            client_id,
            time_of_last_keepalive: now,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub const fn time_of_last_keepalive(&self) -> NanoTime {
        self.time_of_last_keepalive
    }

    pub const fn keepalive(&mut self, now: NanoTime) {
        self.time_of_last_keepalive = now;
    }

    /// Silent for strictly longer than `timeout`.
    #[must_use]
    pub fn has_timed_out(&self, now: NanoTime, timeout: NanoDuration) -> bool {
        now > self.time_of_last_keepalive + timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_out_strictly_after_liveness() {
        let mut client = AeronClient::new(ClientId(1), NanoTime::new(100));
        let timeout = NanoDuration::new(50);
        assert!(!client.has_timed_out(NanoTime::new(150), timeout));
        assert!(client.has_timed_out(NanoTime::new(151), timeout));

        client.keepalive(NanoTime::new(150));
        assert!(!client.has_timed_out(NanoTime::new(151), timeout));
        assert_eq!(client.client_id(), ClientId(1));
    }
}
