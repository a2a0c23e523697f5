//! Struct and implementation of the Peer entry in the routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::{Ipv4Addr, SocketAddr},
};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq)]
/// A peer of the overlay: an id plus the UDP endpoint it answers on.
///
/// The endpoint is a [SocketAddr], covering both IPv4 and IPv6 (with scope)
/// addresses.
pub struct Peer {
    pub(crate) id: Id,
    pub(crate) address: SocketAddr,
}

impl Peer {
    pub fn new<A: Into<SocketAddr>>(id: Id, address: A) -> Peer {
        Peer {
            id,
            address: address.into(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Creates a peer with a random Id for testing purposes.
    pub fn random() -> Peer {
        Peer {
            id: Id::random(),
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        }
    }
}

impl Debug for Peer {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}
