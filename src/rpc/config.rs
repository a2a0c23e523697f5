use std::{
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use super::{INITIAL_CONTACT_TIMEOUT, PEER_LOOKUP_TIMEOUT};

#[derive(Debug, Clone)]
/// Node configuration.
pub struct Config {
    /// Local IPv4 interface to bind. `None` disables the IPv4 socket.
    ///
    /// Defaults to the unspecified address.
    pub ipv4: Option<Ipv4Addr>,
    /// Explicit IPv4 port.
    ///
    /// Defaults to `None`, which tries [DEFAULT_PORT](super::DEFAULT_PORT)
    /// and falls back to an ephemeral port.
    pub ipv4_port: Option<u16>,
    /// Local IPv6 interface to bind. `None` disables the IPv6 socket.
    ///
    /// Defaults to `None`.
    pub ipv6: Option<Ipv6Addr>,
    /// Explicit IPv6 port, with the same semantics as `ipv4_port`.
    pub ipv6_port: Option<u16>,
    /// Textual endpoint (`host:port`) of a known peer used to join the
    /// overlay.
    ///
    /// Defaults to `None`, in which case the node waits for inbound traffic
    /// to learn its first peers.
    pub initial_peer: Option<String>,
    /// Deadline for a response to a lookup request.
    ///
    /// Defaults to [PEER_LOOKUP_TIMEOUT].
    pub request_timeout: Duration,
    /// Deadline for the first answer from each resolved initial peer
    /// endpoint.
    ///
    /// Defaults to [INITIAL_CONTACT_TIMEOUT].
    pub initial_contact_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipv4: Some(Ipv4Addr::UNSPECIFIED),
            ipv4_port: None,
            ipv6: None,
            ipv6_port: None,
            initial_peer: None,
            request_timeout: PEER_LOOKUP_TIMEOUT,
            initial_contact_timeout: INITIAL_CONTACT_TIMEOUT,
        }
    }
}
