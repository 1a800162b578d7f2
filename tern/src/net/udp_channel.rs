//! Parsed `udp://[interface@]host:port` channel URIs.
//!
//! Every endpoint and publication is keyed by the channel's canonical form, so two URIs
//! naming the same destination (e.g. `localhost` and `127.0.0.1`) share one endpoint.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use url::Url;

use super::Endpoint;

const UDP_SCHEME: &str = "udp";

/// Errors produced while parsing a channel URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("malformed channel URI {uri:?}: {reason}")]
    Malformed { uri: String, reason: String },
    #[error("unsupported scheme {0:?}, expected \"udp\"")]
    UnsupportedScheme(String),
    #[error("channel URI {0:?} has no host")]
    MissingHost(String),
    #[error("channel URI {0:?} has no port")]
    MissingPort(String),
    #[error("cannot resolve {0:?} to an IPv4 address")]
    UnresolvedHost(String),
    #[error("IPv6 address {0} is not supported")]
    Ipv6(IpAddr),
    #[error("multicast data address {0} must have an odd last octet below 255")]
    EvenMulticastAddress(Ipv4Addr),
}

/// A validated UDP channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpChannel {
    uri: String,
    canonical: String,
    local_interface: Endpoint,
    remote_data: Endpoint,
    remote_control: Endpoint,
    multicast: bool,
}

impl UdpChannel {
    /// Parses and resolves a channel URI.
    ///
    /// # Errors
    /// Returns [`ChannelError`] if the URI is not a `udp` URI with a resolvable IPv4
    /// host and a port, or names an even multicast group address.
    pub fn parse(uri: &str) -> Result<Self, ChannelError> {
        let url = Url::parse(uri).map_err(|e| ChannelError::Malformed {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?;
        if url.scheme() != UDP_SCHEME {
            return Err(ChannelError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ChannelError::MissingHost(uri.to_owned()))?;
        let port = url
            .port()
            .ok_or_else(|| ChannelError::MissingPort(uri.to_owned()))?;
        let remote_ip = resolve(host)?;

        let interface_ip = match url.username() {
            "" => None,
            name => Some(resolve(name)?),
        };
        let local_interface = Endpoint::new(
            IpAddr::V4(interface_ip.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            0,
        );

        let remote_data = Endpoint::new(IpAddr::V4(remote_ip), port);
        let multicast = remote_ip.is_multicast();
        let remote_control = if multicast {
            let [a, b, c, d] = remote_ip.octets();
            if d % 2 == 0 || d == u8::MAX {
                return Err(ChannelError::EvenMulticastAddress(remote_ip));
            }
            Endpoint::new_v4(a, b, c, d + 1, port)
        } else {
            remote_data
        };

        let canonical = canonical_form(local_interface, remote_data);

        Ok(Self {
            uri: uri.to_owned(),
            canonical,
            local_interface,
            remote_data,
            remote_control,
            multicast,
        })
    }

    /// The URI as supplied by the client.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// `UDP-<local-hex>-<local-port>-<remote-hex>-<remote-port>`.
    #[must_use]
    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub const fn local_interface(&self) -> Endpoint {
        self.local_interface
    }

    #[must_use]
    pub const fn remote_data(&self) -> Endpoint {
        self.remote_data
    }

    /// Where status messages and NAKs are sent; for multicast the next group address.
    #[must_use]
    pub const fn remote_control(&self) -> Endpoint {
        self.remote_control
    }

    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.multicast
    }
}

impl std::fmt::Display for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UdpChannel - interface: {}, data: {}, control: {}",
            self.local_interface, self.remote_data, self.remote_control
        )
    }
}

fn resolve(host: &str) -> Result<Ipv4Addr, ChannelError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(ChannelError::Ipv6(ip)),
        };
    }
    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| {
            addrs.find_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
        })
        .ok_or_else(|| ChannelError::UnresolvedHost(host.to_owned()))
}

fn canonical_form(local: Endpoint, remote: Endpoint) -> String {
    format!(
        "UDP-{:08x}-{}-{:08x}-{}",
        local.ipv4_bits().unwrap_or(0),
        local.port(),
        remote.ipv4_bits().unwrap_or(0),
        remote.port()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_channel() {
        let channel = UdpChannel::parse("udp://127.0.0.1:40123").unwrap();
        assert!(!channel.is_multicast());
        assert_eq!(channel.remote_data(), Endpoint::localhost(40123));
        assert_eq!(channel.remote_control(), channel.remote_data());
        assert_eq!(channel.local_interface(), Endpoint::any(0));
        assert_eq!(channel.canonical_form(), "UDP-00000000-0-7f000001-40123");
        assert_eq!(channel.uri(), "udp://127.0.0.1:40123");
    }

    #[test]
    fn hostname_and_address_share_canonical_form() {
        let by_name = UdpChannel::parse("udp://localhost:40123").unwrap();
        let by_addr = UdpChannel::parse("udp://127.0.0.1:40123").unwrap();
        assert_eq!(by_name.canonical_form(), by_addr.canonical_form());
    }

    #[test]
    fn unicast_with_interface() {
        let channel = UdpChannel::parse("udp://192.168.1.20@192.168.1.30:40124").unwrap();
        assert_eq!(channel.local_interface(), Endpoint::new_v4(192, 168, 1, 20, 0));
        assert_eq!(channel.canonical_form(), "UDP-c0a80114-0-c0a8011e-40124");
    }

    #[test]
    fn multicast_control_address_is_next_group() {
        let channel = UdpChannel::parse("udp://192.168.1.20@224.10.9.9:40124").unwrap();
        assert!(channel.is_multicast());
        assert_eq!(channel.remote_data(), Endpoint::new_v4(224, 10, 9, 9, 40124));
        assert_eq!(channel.remote_control(), Endpoint::new_v4(224, 10, 9, 10, 40124));
    }

    #[test]
    fn rejects_even_multicast_address() {
        assert_eq!(
            UdpChannel::parse("udp://224.10.9.8:40124"),
            Err(ChannelError::EvenMulticastAddress(Ipv4Addr::new(224, 10, 9, 8)))
        );
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!(
            UdpChannel::parse("tcp://127.0.0.1:1"),
            Err(ChannelError::UnsupportedScheme(s)) if s == "tcp"
        ));
        assert!(matches!(
            UdpChannel::parse("udp://127.0.0.1"),
            Err(ChannelError::MissingPort(_))
        ));
        assert!(matches!(
            UdpChannel::parse("not a uri"),
            Err(ChannelError::Malformed { .. })
        ));
        assert!(matches!(
            UdpChannel::parse("udp://[::1]:40123"),
            Err(ChannelError::Ipv6(_))
        ));
    }
}
