//! UDP socket layer framing inbound datagrams into messages.

use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use super::config::Config;
use crate::messages::Message;

/// Port a node tries to listen on before falling back to an ephemeral one.
pub const DEFAULT_PORT: u16 = 27980;

/// Largest datagram we are willing to frame.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// A pair of UDP sockets, one per address family, either of which may be
/// unconfigured. Outbound sends pick the socket matching the destination's
/// family; the absence of that socket is a transport error for the single
/// send, not a global failure.
pub(crate) struct KadSocket {
    ipv4: Option<UdpSocket>,
    ipv6: Option<UdpSocket>,
}

impl KadSocket {
    pub fn new(config: &Config) -> io::Result<Self> {
        let ipv4 = config
            .ipv4
            .map(|ip| bind(IpAddr::V4(ip), config.ipv4_port))
            .transpose()?;
        let ipv6 = config
            .ipv6
            .map(|ip| bind(IpAddr::V6(ip), config.ipv6_port))
            .transpose()?;

        if ipv4.is_none() && ipv6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one of the IPv4 and IPv6 sockets must be configured",
            ));
        }

        Ok(KadSocket { ipv4, ipv6 })
    }

    // === Getters ===

    pub fn local_addr_v4(&self) -> Option<SocketAddrV4> {
        match self.ipv4.as_ref()?.local_addr() {
            Ok(SocketAddr::V4(address)) => Some(address),
            _ => None,
        }
    }

    pub fn local_addr_v6(&self) -> Option<SocketAddrV6> {
        match self.ipv6.as_ref()?.local_addr() {
            Ok(SocketAddr::V6(address)) => Some(address),
            _ => None,
        }
    }

    // === Public Methods ===

    /// Serializes and sends a message to `to` over the socket matching its
    /// address family.
    pub fn send(&self, message: &Message, to: SocketAddr) -> io::Result<()> {
        let socket = match to {
            SocketAddr::V4(_) => self.ipv4.as_ref(),
            SocketAddr::V6(_) => self.ipv6.as_ref(),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "no socket configured for the destination address family",
            )
        })?;

        socket.send_to(&message.to_bytes(), to)?;
        trace!(?to, kind = message.body.kind(), "sent message");

        Ok(())
    }

    /// Receives and decodes at most one datagram across both sockets.
    /// Corrupted datagrams are dropped with a debug log; when both sockets
    /// are idle the call naps briefly to keep the engine loop polite.
    pub fn recv_from(&self) -> Option<(Message, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut idle = true;

        for socket in [&self.ipv4, &self.ipv6].into_iter().flatten() {
            match socket.recv_from(&mut buf) {
                Ok((amount, from)) => {
                    idle = false;

                    if from.port() == 0 {
                        trace!(?from, "dropping datagram from port 0");
                        continue;
                    }

                    match Message::from_bytes(&buf[..amount]) {
                        Ok(message) => return Some((message, from)),
                        Err(error) => {
                            debug!(?error, ?from, "dropping corrupted datagram");
                        }
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    idle = false;
                    trace!(?error, "recv_from failed unexpectedly");
                }
            }
        }

        if idle {
            std::thread::sleep(Duration::from_micros(100)); // yield for a bit
        }

        None
    }
}

fn bind(ip: IpAddr, port: Option<u16>) -> io::Result<UdpSocket> {
    let socket = match port {
        Some(port) => UdpSocket::bind((ip, port))?,
        None => match UdpSocket::bind((ip, DEFAULT_PORT)) {
            Ok(socket) => Ok(socket),
            Err(_) => UdpSocket::bind((ip, 0)),
        }?,
    };

    // The default OS buffers (~128KB) drop datagrams under bursty DHT
    // traffic; a failure to enlarge them is not fatal.
    if let Err(error) = set_socket_buffers(&socket) {
        debug!(?error, "could not enlarge UDP socket buffers");
    }

    socket.set_nonblocking(true)?;

    Ok(socket)
}

/// Resolves a textual `host:port` endpoint to socket addresses. Resolving to
/// nothing is a hard failure.
pub(crate) fn resolve_endpoint(endpoint: &str) -> io::Result<Vec<SocketAddr>> {
    let addresses: Vec<SocketAddr> = endpoint.to_socket_addrs()?.collect();

    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "endpoint resolved to no addresses",
        ));
    }

    Ok(addresses)
}

#[cfg(unix)]
fn set_socket_buffers(socket: &UdpSocket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    const UDP_SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024; // 2MB

    let fd = socket.as_raw_fd();

    for option in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        let result = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &UDP_SOCKET_BUFFER_SIZE as *const _ as *const _,
                std::mem::size_of_val(&UDP_SOCKET_BUFFER_SIZE) as u32,
            )
        };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &UdpSocket) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::Id;
    use crate::messages::MessageBody;

    fn localhost_config() -> Config {
        Config {
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv4_port: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn requires_at_least_one_socket() {
        let config = Config {
            ipv4: None,
            ipv6: None,
            ..Default::default()
        };

        assert!(KadSocket::new(&config).is_err());
    }

    #[test]
    fn sending_to_an_unconfigured_family_fails() {
        let socket = KadSocket::new(&localhost_config()).unwrap();
        let message = Message::new(Id::random(), Id::random(), MessageBody::PingRequest);

        let result = socket.send(&message, "[::1]:6881".parse().unwrap());
        assert_eq!(
            result.unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }

    #[test]
    fn messages_round_trip_between_sockets() {
        let a = KadSocket::new(&localhost_config()).unwrap();
        let b = KadSocket::new(&localhost_config()).unwrap();

        let message = Message::new(Id::random(), Id::random(), MessageBody::PingRequest);
        a.send(&message, b.local_addr_v4().unwrap().into()).unwrap();

        let received = loop {
            if let Some((message, from)) = b.recv_from() {
                assert_eq!(SocketAddr::V4(a.local_addr_v4().unwrap()), from);
                break message;
            }
        };

        assert_eq!(received, message);
    }

    #[test]
    fn corrupted_datagrams_are_dropped() {
        let a = KadSocket::new(&localhost_config()).unwrap();
        let b = KadSocket::new(&localhost_config()).unwrap();

        a.ipv4
            .as_ref()
            .unwrap()
            .send_to(b"not a message", b.local_addr_v4().unwrap())
            .unwrap();

        for _ in 0..50 {
            assert!(b.recv_from().is_none());
        }
    }

    #[test]
    fn resolve_endpoint_rejects_garbage() {
        assert!(resolve_endpoint("definitely not an endpoint").is_err());
        assert!(!resolve_endpoint("127.0.0.1:6881").unwrap().is_empty());
    }
}
