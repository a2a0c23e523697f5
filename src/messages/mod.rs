//! Wire messages exchanged between peers.
//!
//! Every datagram is a fixed header (version, type, source id, random token)
//! followed by a type-specific body. Decoding failures never panic; they
//! surface as [Error::CorruptedBody] and the caller drops the datagram.

mod wire;

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::{Id, Peer, ID_SIZE};
use crate::{Error, Result};

/// Version tag carried by every message header.
pub const PROTOCOL_VERSION: u8 = 1;

const PING_REQUEST: u8 = 0;
const PING_RESPONSE: u8 = 1;
const STORE_REQUEST: u8 = 2;
const FIND_PEER_REQUEST: u8 = 3;
const FIND_PEER_RESPONSE: u8 = 4;
const FIND_VALUE_REQUEST: u8 = 5;
const FIND_VALUE_RESPONSE: u8 = 6;

/// Fixed header size: version, type, source id, random token.
const HEADER_SIZE: usize = 2 + 2 * ID_SIZE;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: u8,
    /// Id of the sending node; refreshes the sender's routing table entry on
    /// every message.
    pub source_id: Id,
    /// Random token correlating a request with its response. Responses echo
    /// the token of the request they answer.
    pub token: Id,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    PingRequest,
    PingResponse,
    StoreRequest(StoreRequestArguments),
    FindPeerRequest(FindPeerRequestArguments),
    FindPeerResponse(FindPeerResponseArguments),
    FindValueRequest(FindValueRequestArguments),
    FindValueResponse(FindValueResponseArguments),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindPeerRequestArguments {
    pub target: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindPeerResponseArguments {
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueResponseArguments {
    pub value: Bytes,
}

impl MessageBody {
    pub fn kind(&self) -> u8 {
        match self {
            MessageBody::PingRequest => PING_REQUEST,
            MessageBody::PingResponse => PING_RESPONSE,
            MessageBody::StoreRequest(_) => STORE_REQUEST,
            MessageBody::FindPeerRequest(_) => FIND_PEER_REQUEST,
            MessageBody::FindPeerResponse(_) => FIND_PEER_RESPONSE,
            MessageBody::FindValueRequest(_) => FIND_VALUE_REQUEST,
            MessageBody::FindValueResponse(_) => FIND_VALUE_RESPONSE,
        }
    }
}

impl Message {
    pub fn new(source_id: Id, token: Id, body: MessageBody) -> Message {
        Message {
            version: PROTOCOL_VERSION,
            source_id,
            token,
            body,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);

        buf.put_u8(self.version);
        buf.put_u8(self.body.kind());
        wire::put_id(&mut buf, &self.source_id);
        wire::put_id(&mut buf, &self.token);

        match &self.body {
            MessageBody::PingRequest | MessageBody::PingResponse => {}
            MessageBody::StoreRequest(args) => {
                wire::put_id(&mut buf, &args.key);
                wire::put_blob(&mut buf, &args.value);
            }
            MessageBody::FindPeerRequest(args) => wire::put_id(&mut buf, &args.target),
            MessageBody::FindPeerResponse(args) => {
                buf.put_u64_le(args.peers.len() as u64);
                for peer in &args.peers {
                    wire::put_peer(&mut buf, peer);
                }
            }
            MessageBody::FindValueRequest(args) => wire::put_id(&mut buf, &args.key),
            MessageBody::FindValueResponse(args) => wire::put_blob(&mut buf, &args.value),
        }

        buf.freeze()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        let mut buf = Bytes::copy_from_slice(bytes.as_ref());

        let version = wire::get_u8(&mut buf)?;
        if version != PROTOCOL_VERSION {
            return Err(Error::CorruptedBody("unsupported protocol version"));
        }

        let kind = wire::get_u8(&mut buf)?;
        let source_id = wire::get_id(&mut buf)?;
        let token = wire::get_id(&mut buf)?;

        let body = match kind {
            PING_REQUEST => MessageBody::PingRequest,
            PING_RESPONSE => MessageBody::PingResponse,
            STORE_REQUEST => MessageBody::StoreRequest(StoreRequestArguments {
                key: wire::get_id(&mut buf)?,
                value: wire::get_blob(&mut buf)?,
            }),
            FIND_PEER_REQUEST => MessageBody::FindPeerRequest(FindPeerRequestArguments {
                target: wire::get_id(&mut buf)?,
            }),
            FIND_PEER_RESPONSE => {
                let count = wire::get_u64(&mut buf)?;
                if count > (buf.len() / wire::MIN_PEER_SIZE) as u64 {
                    return Err(Error::CorruptedBody("truncated"));
                }

                let mut peers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    peers.push(wire::get_peer(&mut buf)?);
                }

                MessageBody::FindPeerResponse(FindPeerResponseArguments { peers })
            }
            FIND_VALUE_REQUEST => MessageBody::FindValueRequest(FindValueRequestArguments {
                key: wire::get_id(&mut buf)?,
            }),
            FIND_VALUE_RESPONSE => MessageBody::FindValueResponse(FindValueResponseArguments {
                value: wire::get_blob(&mut buf)?,
            }),
            _ => return Err(Error::CorruptedBody("unknown message type")),
        };

        Ok(Message {
            version,
            source_id,
            token,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use std::net::{Ipv6Addr, SocketAddrV6};

    use super::*;

    fn round_trip(body: MessageBody) {
        let message = Message::new(Id::random(), Id::random(), body);
        let decoded = Message::from_bytes(message.to_bytes()).unwrap();

        assert_eq!(message, decoded);
    }

    #[test]
    fn ping_round_trips() {
        round_trip(MessageBody::PingRequest);
        round_trip(MessageBody::PingResponse);
    }

    #[test]
    fn store_request_round_trips() {
        round_trip(MessageBody::StoreRequest(StoreRequestArguments {
            key: Id::random(),
            value: Bytes::from_static(b"an opaque value"),
        }));

        round_trip(MessageBody::StoreRequest(StoreRequestArguments {
            key: Id::random(),
            value: Bytes::new(),
        }));
    }

    #[test]
    fn find_peer_round_trips() {
        round_trip(MessageBody::FindPeerRequest(FindPeerRequestArguments {
            target: Id::random(),
        }));

        let v6 = Peer::new(
            Id::random(),
            SocketAddrV6::new(Ipv6Addr::LOCALHOST, 6881, 0, 7),
        );
        round_trip(MessageBody::FindPeerResponse(FindPeerResponseArguments {
            peers: vec![Peer::random(), v6, Peer::random()],
        }));
        round_trip(MessageBody::FindPeerResponse(FindPeerResponseArguments {
            peers: vec![],
        }));
    }

    #[test]
    fn find_value_round_trips() {
        round_trip(MessageBody::FindValueRequest(FindValueRequestArguments {
            key: Id::random(),
        }));
        round_trip(MessageBody::FindValueResponse(FindValueResponseArguments {
            value: Bytes::from_static(b"found"),
        }));
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let message = Message::new(
            Id::random(),
            Id::random(),
            MessageBody::StoreRequest(StoreRequestArguments {
                key: Id::random(),
                value: Bytes::from_static(b"an opaque value"),
            }),
        );
        let bytes = message.to_bytes();

        for length in 0..bytes.len() {
            assert!(
                matches!(
                    Message::from_bytes(&bytes[..length]),
                    Err(Error::CorruptedBody(_))
                ),
                "prefix of {length} bytes should not decode"
            );
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = Message::new(Id::random(), Id::random(), MessageBody::PingRequest)
            .to_bytes()
            .to_vec();
        bytes[1] = 42;

        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::CorruptedBody("unknown message type"))
        ));
    }

    #[test]
    fn unknown_endpoint_discriminator_is_rejected() {
        let message = Message::new(
            Id::random(),
            Id::random(),
            MessageBody::FindPeerResponse(FindPeerResponseArguments {
                peers: vec![Peer::random()],
            }),
        );
        let mut bytes = message.to_bytes().to_vec();
        // The discriminator follows the header, the peer count, and the id.
        bytes[HEADER_SIZE + 8 + ID_SIZE] = 9;

        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::CorruptedBody("unknown endpoint discriminator"))
        ));
    }

    #[test]
    fn oversized_peer_count_is_rejected() {
        let message = Message::new(
            Id::random(),
            Id::random(),
            MessageBody::FindPeerResponse(FindPeerResponseArguments { peers: vec![] }),
        );
        let mut bytes = message.to_bytes().to_vec();
        bytes[HEADER_SIZE] = 0xff;

        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::CorruptedBody(_))
        ));
    }
}
