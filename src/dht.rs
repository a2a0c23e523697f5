//! Dht node: a client facade running the engine on a dedicated thread.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{debug, error};

use crate::common::Id;
use crate::rpc::{Config, Engine};
use crate::{Error, Result};

/// A handle to a running node.
///
/// `put` and `get` hash arbitrary byte keys into the 160 bit keyspace and
/// block until the overlay answers; the engine itself never leaves its
/// thread.
pub struct Dht {
    sender: flume::Sender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
    info: NodeInfo,
}

#[derive(Debug, Clone)]
struct NodeInfo {
    id: Id,
    ipv4: Option<SocketAddrV4>,
    ipv6: Option<SocketAddrV6>,
}

enum ActorMessage {
    Save(Id, Bytes, flume::Sender<Result<(), Error>>),
    Load(Id, flume::Sender<Result<Bytes>>),
    Shutdown,
}

impl Dht {
    /// Creates a node and, if `config.initial_peer` is set, blocks until it
    /// has joined the overlay through that peer or the join failed with
    /// [Error::InitialPeerFailedToRespond].
    pub fn new(config: Config) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let (ready_sender, ready_receiver) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("agora-dht".to_string())
            .spawn(move || run(config, receiver, ready_sender))?;

        let info = ready_receiver.recv().map_err(|_| Error::Shutdown)??;

        Ok(Dht {
            sender,
            handle: Some(handle),
            info,
        })
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> &Id {
        &self.info.id
    }

    /// Returns the address of the node's IPv4 socket, if configured.
    pub fn local_addr_v4(&self) -> Option<SocketAddrV4> {
        self.info.ipv4
    }

    /// Returns the address of the node's IPv6 socket, if configured.
    pub fn local_addr_v6(&self) -> Option<SocketAddrV6> {
        self.info.ipv6
    }

    // === Public Methods ===

    /// Stores `value` under `key` on the peers closest to its hash. Blocks
    /// until the store requests have been dispatched; the protocol carries no
    /// acknowledgement beyond that.
    pub fn put<K: AsRef<[u8]>, V: Into<Bytes>>(&self, key: K, value: V) -> Result<(), Error> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Save(
                Id::hash(key),
                value.into(),
                sender,
            ))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    /// Looks `key` up on the overlay. Blocks until a peer serves the value
    /// or the lookup exhausts with [Error::ValueNotFound].
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Bytes> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Load(Id::hash(key), sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    /// Stops the engine thread and waits for it to finish.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    config: Config,
    receiver: flume::Receiver<ActorMessage>,
    ready: flume::Sender<Result<NodeInfo>>,
) {
    let initial_peer = config.initial_peer.clone();

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };

    if let Some(initial_peer) = initial_peer {
        if let Err(error) = engine.bootstrap(&initial_peer) {
            let _ = ready.send(Err(error));
            return;
        }

        while !engine.is_connected() {
            if let Err(error) = engine.tick() {
                let _ = ready.send(Err(error));
                return;
            }
        }
    }

    let _ = ready.send(Ok(NodeInfo {
        id: *engine.id(),
        ipv4: engine.local_addr_v4(),
        ipv6: engine.local_addr_v6(),
    }));

    loop {
        while let Ok(message) = receiver.try_recv() {
            match message {
                ActorMessage::Save(key, value, sender) => engine.async_save(
                    key,
                    value,
                    Box::new(move |result| {
                        let _ = sender.send(result);
                    }),
                ),
                ActorMessage::Load(key, sender) => engine.async_load(
                    key,
                    Box::new(move |result| {
                        let _ = sender.send(result);
                    }),
                ),
                ActorMessage::Shutdown => {
                    debug!("shutting down");
                    return;
                }
            }
        }

        if let Err(error) = engine.tick() {
            error!(?error, "engine failed");
            return;
        }
    }
}
