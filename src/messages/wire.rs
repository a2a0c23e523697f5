//! Buffer primitives shared by the message codec.
//!
//! All integers are little-endian, ids are raw 20 byte big-endian values, and
//! variable length fields carry a `u64` length prefix. Every reader returns
//! [Error::CorruptedBody] instead of panicking on truncated input.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::common::{Id, Peer, ID_SIZE};
use crate::{Error, Result};

/// Endpoint discriminator for IPv4 addresses.
const ENDPOINT_IPV4: u8 = 4;
/// Endpoint discriminator for IPv6 addresses.
const ENDPOINT_IPV6: u8 = 6;

/// Smallest possible encoded peer: id, discriminator, IPv4 address, port.
pub(super) const MIN_PEER_SIZE: usize = ID_SIZE + 1 + 4 + 2;

pub(super) fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::CorruptedBody("truncated"));
    }

    Ok(buf.get_u8())
}

pub(super) fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::CorruptedBody("truncated"));
    }

    Ok(buf.get_u16_le())
}

pub(super) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::CorruptedBody("truncated"));
    }

    Ok(buf.get_u32_le())
}

pub(super) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptedBody("truncated"));
    }

    Ok(buf.get_u64_le())
}

pub(super) fn get_id(buf: &mut Bytes) -> Result<Id> {
    if buf.remaining() < ID_SIZE {
        return Err(Error::CorruptedBody("truncated"));
    }

    let mut bytes = [0; ID_SIZE];
    buf.copy_to_slice(&mut bytes);

    Ok(Id(bytes))
}

pub(super) fn put_id(buf: &mut BytesMut, id: &Id) {
    buf.put_slice(id.as_bytes());
}

/// Reads a `u64` length-prefixed byte sequence.
pub(super) fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let length = get_u64(buf)?;
    if length > buf.remaining() as u64 {
        return Err(Error::CorruptedBody("truncated"));
    }

    Ok(buf.split_to(length as usize))
}

pub(super) fn put_blob(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u64_le(bytes.len() as u64);
    buf.put_slice(bytes);
}

pub(super) fn get_peer(buf: &mut Bytes) -> Result<Peer> {
    let id = get_id(buf)?;

    let address: SocketAddr = match get_u8(buf)? {
        ENDPOINT_IPV4 => {
            if buf.remaining() < 4 {
                return Err(Error::CorruptedBody("truncated"));
            }
            let mut octets = [0; 4];
            buf.copy_to_slice(&mut octets);
            let port = get_u16(buf)?;

            SocketAddrV4::new(Ipv4Addr::from(octets), port).into()
        }
        ENDPOINT_IPV6 => {
            if buf.remaining() < 16 {
                return Err(Error::CorruptedBody("truncated"));
            }
            let mut octets = [0; 16];
            buf.copy_to_slice(&mut octets);
            let port = get_u16(buf)?;
            let scope_id = get_u32(buf)?;

            SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, scope_id).into()
        }
        _ => return Err(Error::CorruptedBody("unknown endpoint discriminator")),
    };

    Ok(Peer::new(id, address))
}

pub(super) fn put_peer(buf: &mut BytesMut, peer: &Peer) {
    put_id(buf, peer.id());

    match peer.address() {
        SocketAddr::V4(address) => {
            buf.put_u8(ENDPOINT_IPV4);
            buf.put_slice(&address.ip().octets());
            buf.put_u16_le(address.port());
        }
        SocketAddr::V6(address) => {
            buf.put_u8(ENDPOINT_IPV6);
            buf.put_slice(&address.ip().octets());
            buf.put_u16_le(address.port());
            buf.put_u32_le(address.scope_id());
        }
    }
}
