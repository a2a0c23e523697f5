//! The engine: a single-threaded state machine multiplexing concurrent
//! iterative lookups over a pair of UDP sockets.

mod config;
mod lookup;
mod router;
mod socket;
mod timeout;
mod value_store;

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{Id, Peer, RoutingTable, ID_BITS};
use crate::messages::{
    FindPeerRequestArguments, FindPeerResponseArguments, FindValueRequestArguments,
    FindValueResponseArguments, Message, MessageBody, StoreRequestArguments,
};
use crate::{Error, Result};

pub use config::Config;
pub use lookup::{LoadHandler, SaveHandler};
pub use socket::DEFAULT_PORT;

use lookup::{CandidateSet, Lookup};
use router::{OnError, OnMessage, PendingRequest, ResponseRouter};
use socket::KadSocket;
use timeout::{EngineTask, TimeoutManager};
use value_store::ValueStore;

/// Number of lookup requests kept in flight per iterative search.
pub const CONCURRENT_LOOKUP_REQUESTS: usize = 3;

/// Number of peers asked to store each saved value.
pub const REDUNDANT_SAVE_COUNT: usize = 3;

/// Default deadline for a response to a lookup request.
pub const PEER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for the first answer from a resolved initial peer
/// endpoint during bootstrap.
pub const INITIAL_CONTACT_TIMEOUT: Duration = Duration::from_secs(1);

/// A Kademlia node: routing table, local value store, and the dispatch logic
/// tying inbound messages to request handlers and pending lookups.
///
/// The engine is bound to the thread driving [Engine::tick]; it contains no
/// locks and every callback runs on that thread. [crate::Dht] wraps it in a
/// dedicated thread with a channel API.
pub struct Engine {
    id: Id,
    socket: KadSocket,
    routing_table: RoutingTable,
    values: ValueStore,
    router: ResponseRouter,
    timeouts: TimeoutManager,
    lookups: HashMap<u64, Lookup>,
    next_lookup_id: u64,
    /// Save and load calls made before the first inbound message, replayed in
    /// order once the node is connected.
    pending_tasks: VecDeque<EngineTask>,
    is_connected: bool,
    bootstrap_error: Option<Error>,
    request_timeout: Duration,
    initial_contact_timeout: Duration,
}

impl Engine {
    /// Creates an engine with a random id, bound to the configured sockets.
    /// No bootstrap is attempted; see [Engine::bootstrap].
    pub fn new(config: Config) -> Result<Self> {
        let id = Id::random();
        let socket = KadSocket::new(&config)?;

        debug!(
            id = %id,
            ipv4 = ?socket.local_addr_v4(),
            ipv6 = ?socket.local_addr_v6(),
            "created engine"
        );

        Ok(Engine {
            id,
            socket,
            routing_table: RoutingTable::new(id),
            values: ValueStore::new(),
            router: ResponseRouter::new(),
            timeouts: TimeoutManager::new(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            pending_tasks: VecDeque::new(),
            is_connected: false,
            bootstrap_error: None,
            request_timeout: config.request_timeout,
            initial_contact_timeout: config.initial_contact_timeout,
        })
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address of the IPv4 socket, if configured.
    pub fn local_addr_v4(&self) -> Option<SocketAddrV4> {
        self.socket.local_addr_v4()
    }

    /// Returns the address of the IPv6 socket, if configured.
    pub fn local_addr_v6(&self) -> Option<SocketAddrV6> {
        self.socket.local_addr_v6()
    }

    /// A node is connected once it has heard from any peer.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Earliest pending request deadline; embedding loops may use it to bound
    /// their own sleeps.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    // === Public Methods ===

    /// Joins the overlay through a known peer: resolves the textual endpoint
    /// and asks each resolved address in turn for the peers closest to our
    /// own id, until one answers. The failure of the last endpoint surfaces
    /// as [Error::InitialPeerFailedToRespond] from [Engine::tick].
    pub fn bootstrap(&mut self, initial_peer: &str) -> Result<()> {
        let endpoints = match socket::resolve_endpoint(initial_peer) {
            Ok(endpoints) => endpoints,
            Err(error) => {
                debug!(?error, initial_peer, "failed to resolve initial peer");
                return Err(Error::InitialPeerFailedToRespond);
            }
        };

        debug!(initial_peer, count = endpoints.len(), "bootstrapping");
        self.search_ourselves(endpoints);

        Ok(())
    }

    /// Advances the engine: delivers due timeouts, then receives and
    /// dispatches at most one inbound datagram.
    pub fn tick(&mut self) -> Result<()> {
        let due = self.timeouts.pop_expired(Instant::now());
        for task in due {
            task(self);
        }

        if let Some(error) = self.bootstrap_error.take() {
            return Err(error);
        }

        if let Some((message, from)) = self.socket.recv_from() {
            self.handle_inbound(from, message);
        }

        Ok(())
    }

    /// Stores `value` under `target` on the peers of the overlay closest to
    /// `target`. The handler is invoked exactly once; storing is
    /// unacknowledged by the protocol, so `Ok` does not imply any peer kept
    /// the value.
    ///
    /// Called before the node is connected, the operation is queued and
    /// replayed when the first inbound message arrives.
    pub fn async_save(&mut self, target: Id, value: Bytes, handler: SaveHandler) {
        if !self.is_connected {
            debug!(key = %target, "delaying save until a peer is heard");
            self.pending_tasks
                .push_back(Box::new(move |engine| engine.async_save(target, value, handler)));
            return;
        }

        debug!(key = %target, "starting save lookup");
        let seeds = self.routing_table.closest(&target);
        let lookup_id = self.insert_lookup(Lookup::Store {
            state: CandidateSet::new(target, seeds),
            value,
            handler: Some(handler),
        });

        self.drive_store(lookup_id);
        self.try_store_phase(lookup_id);
    }

    /// Looks `target` up on the overlay. The handler is invoked exactly once
    /// with the value or [Error::ValueNotFound].
    ///
    /// Called before the node is connected, the operation is queued and
    /// replayed when the first inbound message arrives.
    pub fn async_load(&mut self, target: Id, handler: LoadHandler) {
        if !self.is_connected {
            debug!(key = %target, "delaying load until a peer is heard");
            self.pending_tasks
                .push_back(Box::new(move |engine| engine.async_load(target, handler)));
            return;
        }

        debug!(key = %target, "starting load lookup");
        let seeds = self.routing_table.closest(&target);
        let lookup_id = self.insert_lookup(Lookup::FindValue {
            state: CandidateSet::new(target, seeds),
            handler: Some(handler),
        });

        self.drive_find_value(lookup_id);
        self.complete_find_value(lookup_id);
    }

    // === Inbound dispatch ===

    fn handle_inbound(&mut self, from: SocketAddr, message: Message) {
        trace!(?from, kind = message.body.kind(), "received message");

        let Message {
            source_id,
            token,
            body,
            ..
        } = message;

        // Every message refreshes the sender's routing table position.
        self.routing_table.push(Peer::new(source_id, from));

        if !self.is_connected {
            self.is_connected = true;
            self.execute_pending_tasks();
        }

        match body {
            MessageBody::PingRequest => {
                debug!(?from, "handling ping request");
                self.send_response(token, MessageBody::PingResponse, from);
            }
            MessageBody::StoreRequest(args) => {
                debug!(key = %args.key, length = args.value.len(), "handling store request");
                self.values.put(args.key, args.value);
            }
            MessageBody::FindPeerRequest(args) => {
                debug!(target = %args.target, "handling find peer request");
                self.send_find_peer_response(token, &args.target, from);
            }
            MessageBody::FindValueRequest(args) => {
                debug!(key = %args.key, "handling find value request");
                self.handle_find_value_request(token, &args.key, from);
            }
            body => self.handle_response(from, token, body),
        }
    }

    fn send_find_peer_response(&mut self, token: Id, target: &Id, to: SocketAddr) {
        let peers = self.routing_table.closest(target);

        self.send_response(
            token,
            MessageBody::FindPeerResponse(FindPeerResponseArguments { peers }),
            to,
        );
    }

    fn handle_find_value_request(&mut self, token: Id, key: &Id, to: SocketAddr) {
        match self.values.get(key) {
            Some(value) => self.send_response(
                token,
                MessageBody::FindValueResponse(FindValueResponseArguments { value }),
                to,
            ),
            None => self.send_find_peer_response(token, key, to),
        }
    }

    fn handle_response(&mut self, from: SocketAddr, token: Id, body: MessageBody) {
        let Some(request) = self.router.remove(&token) else {
            debug!(?from, "dropping response with unknown token");
            return;
        };

        self.timeouts.cancel(request.timeout);
        (request.on_message)(self, from, body);
    }

    fn execute_pending_tasks(&mut self) {
        debug!(count = self.pending_tasks.len(), "executing pending tasks");

        while let Some(task) = self.pending_tasks.pop_front() {
            task(self);
        }
    }

    // === Request dispatch ===

    /// Serializes `body` under a fresh random token, registers the callbacks
    /// with the response router, and sends the datagram. Exactly one of the
    /// callbacks will run: `on_message` on response, `on_error` on timeout or
    /// when the send itself fails.
    fn send_request(
        &mut self,
        body: MessageBody,
        to: SocketAddr,
        timeout: Duration,
        on_message: OnMessage,
        on_error: OnError,
    ) {
        let token = Id::random();
        let message = Message::new(self.id, token, body);

        let deadline = self.timeouts.expires_from_now(
            timeout,
            Box::new(move |engine| engine.handle_request_timeout(token)),
        );

        if let Err(request) = self.router.register(
            token,
            PendingRequest {
                on_message,
                on_error,
                timeout: deadline,
            },
        ) {
            self.timeouts.cancel(deadline);
            (request.on_error)(self, Error::AlreadyPending);
            return;
        }

        if let Err(error) = self.socket.send(&message, to) {
            debug!(?error, ?to, "failed to send request");
            if let Some(request) = self.router.remove(&token) {
                self.timeouts.cancel(request.timeout);
                (request.on_error)(self, error.into());
            }
        }
    }

    /// Sends a response reusing the token of the request it answers. No
    /// registration, no retries.
    fn send_response(&mut self, token: Id, body: MessageBody, to: SocketAddr) {
        let message = Message::new(self.id, token, body);

        if let Err(error) = self.socket.send(&message, to) {
            debug!(?error, ?to, "failed to send response");
        }
    }

    /// Fire-and-forget request under a fresh token; no response is expected.
    fn send_oneway_request(&mut self, body: MessageBody, to: SocketAddr) {
        let message = Message::new(self.id, Id::random(), body);

        if let Err(error) = self.socket.send(&message, to) {
            debug!(?error, ?to, "failed to send one-way request");
        }
    }

    fn handle_request_timeout(&mut self, token: Id) {
        if let Some(request) = self.router.remove(&token) {
            debug!(token = %token, "request timed out");
            (request.on_error)(self, Error::AssociationTimeout);
        }
    }

    // === Bootstrap ===

    /// Asks the next resolved endpoint for the peers closest to our own id.
    /// Endpoints are consumed from the back; exhaustion is fatal.
    fn search_ourselves(&mut self, mut endpoints: Vec<SocketAddr>) {
        let Some(endpoint) = endpoints.pop() else {
            self.bootstrap_error = Some(Error::InitialPeerFailedToRespond);
            return;
        };

        debug!(?endpoint, "contacting initial peer");
        let target = self.id;
        let timeout = self.initial_contact_timeout;

        self.send_request(
            MessageBody::FindPeerRequest(FindPeerRequestArguments { target }),
            endpoint,
            timeout,
            Box::new(|engine, _from, body| engine.handle_initial_contact_response(body)),
            Box::new(move |engine, _error| engine.search_ourselves(endpoints)),
        );
    }

    fn handle_initial_contact_response(&mut self, body: MessageBody) {
        let MessageBody::FindPeerResponse(args) = body else {
            debug!("ignoring unexpected initial contact response");
            return;
        };

        debug!(count = args.peers.len(), "adding initial peers");
        for peer in args.peers {
            self.routing_table.push(peer);
        }

        self.notify_neighbors();
    }

    /// Refreshes every bucket: for each bit position, starts a background
    /// lookup toward our own id with that bit flipped. The peers discovered
    /// along the way reach the routing table through the normal inbound
    /// dispatch path.
    fn notify_neighbors(&mut self) {
        debug!("refreshing all buckets");

        for bit in (0..ID_BITS).rev() {
            let refresh_id = self.id.with_flipped_bit(bit);
            self.start_refresh(refresh_id);
        }
    }

    fn start_refresh(&mut self, target: Id) {
        let seeds = self.routing_table.closest(&target);
        if seeds.is_empty() {
            return;
        }

        let lookup_id = self.insert_lookup(Lookup::Refresh {
            state: CandidateSet::new(target, seeds),
        });

        self.drive_refresh(lookup_id);
        self.release_if_settled(lookup_id);
    }

    // === Lookups ===

    fn insert_lookup(&mut self, lookup: Lookup) -> u64 {
        let lookup_id = self.next_lookup_id;
        self.next_lookup_id = self.next_lookup_id.wrapping_add(1);

        self.lookups.insert(lookup_id, lookup);

        lookup_id
    }

    /// Drops a lookup whose handler has fired and whose last outstanding
    /// request has completed.
    fn release_if_settled(&mut self, lookup_id: u64) {
        if self
            .lookups
            .get(&lookup_id)
            .is_some_and(|lookup| lookup.is_settled())
        {
            self.lookups.remove(&lookup_id);
            trace!(lookup_id, "lookup released");
        }
    }

    /// Selects the next batch of unqueried candidates of a lookup and returns
    /// them along with the lookup target.
    fn select_batch(&mut self, lookup_id: u64) -> Option<(Id, Vec<Peer>)> {
        let state = match self.lookups.get_mut(&lookup_id)? {
            Lookup::FindValue { state, .. }
            | Lookup::Store { state, .. }
            | Lookup::Refresh { state } => state,
        };

        Some((
            state.target(),
            state.select_new_closest_candidates(CONCURRENT_LOOKUP_REQUESTS),
        ))
    }

    // --- FIND_VALUE ---

    fn drive_find_value(&mut self, lookup_id: u64) {
        let Some((key, batch)) = self.select_batch(lookup_id) else {
            return;
        };
        let timeout = self.request_timeout;

        for peer in batch {
            trace!(key = %key, candidate = %peer.id(), "sending find value request");
            let candidate = *peer.id();

            self.send_request(
                MessageBody::FindValueRequest(FindValueRequestArguments { key }),
                peer.address(),
                timeout,
                Box::new(move |engine, _from, body| {
                    engine.on_find_value_response(lookup_id, candidate, body)
                }),
                Box::new(move |engine, _error| engine.on_find_value_error(lookup_id, candidate)),
            );
        }
    }

    fn on_find_value_response(&mut self, lookup_id: u64, candidate: Id, body: MessageBody) {
        enum Step {
            Found(Bytes),
            Drive,
            Wait,
        }

        let step = match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::FindValue { state, .. }) => {
                state.flag_candidate_as_valid(&candidate);

                if state.is_caller_notified() {
                    Step::Wait
                } else {
                    match body {
                        MessageBody::FindValueResponse(args) => Step::Found(args.value),
                        MessageBody::FindPeerResponse(args) => {
                            if state.are_these_candidates_closest(args.peers) {
                                Step::Drive
                            } else {
                                Step::Wait
                            }
                        }
                        other => {
                            debug!(
                                kind = other.kind(),
                                "ignoring unexpected response during value lookup"
                            );
                            Step::Wait
                        }
                    }
                }
            }
            _ => return,
        };

        match step {
            Step::Found(value) => self.notify_load(lookup_id, Ok(value)),
            Step::Drive => self.drive_find_value(lookup_id),
            Step::Wait => {}
        }

        self.complete_find_value(lookup_id);
    }

    fn on_find_value_error(&mut self, lookup_id: u64, candidate: Id) {
        let drive = match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::FindValue { state, .. }) => {
                state.flag_candidate_as_invalid(&candidate);
                !state.is_caller_notified()
            }
            _ => return,
        };

        if drive {
            self.drive_find_value(lookup_id);
        }

        self.complete_find_value(lookup_id);
    }

    /// Reports [Error::ValueNotFound] once a value lookup has exhausted its
    /// candidates, then releases the lookup if it is settled.
    fn complete_find_value(&mut self, lookup_id: u64) {
        let exhausted = match self.lookups.get(&lookup_id) {
            Some(Lookup::FindValue { state, .. }) => {
                !state.is_caller_notified() && state.have_all_requests_completed()
            }
            _ => false,
        };

        if exhausted {
            debug!(lookup_id, "value lookup exhausted its candidates");
            self.notify_load(lookup_id, Err(Error::ValueNotFound));
        }

        self.release_if_settled(lookup_id);
    }

    fn notify_load(&mut self, lookup_id: u64, result: Result<Bytes>) {
        if let Some(Lookup::FindValue { state, handler }) = self.lookups.get_mut(&lookup_id) {
            if state.mark_caller_notified() {
                if let Some(handler) = handler.take() {
                    handler(result);
                }
            }
        }
    }

    // --- STORE ---

    fn drive_store(&mut self, lookup_id: u64) {
        let Some((key, batch)) = self.select_batch(lookup_id) else {
            return;
        };
        let timeout = self.request_timeout;

        for peer in batch {
            trace!(key = %key, candidate = %peer.id(), "sending find peer request to store");
            let candidate = *peer.id();

            self.send_request(
                MessageBody::FindPeerRequest(FindPeerRequestArguments { target: key }),
                peer.address(),
                timeout,
                Box::new(move |engine, _from, body| {
                    engine.on_store_response(lookup_id, candidate, body)
                }),
                Box::new(move |engine, _error| engine.on_store_error(lookup_id, candidate)),
            );
        }
    }

    fn on_store_response(&mut self, lookup_id: u64, candidate: Id, body: MessageBody) {
        let drive = match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::Store { state, .. }) => {
                state.flag_candidate_as_valid(&candidate);

                match body {
                    MessageBody::FindPeerResponse(args) => {
                        state.are_these_candidates_closest(args.peers)
                    }
                    other => {
                        debug!(
                            kind = other.kind(),
                            "ignoring unexpected response during store lookup"
                        );
                        false
                    }
                }
            }
            _ => return,
        };

        if drive {
            self.drive_store(lookup_id);
        }

        self.try_store_phase(lookup_id);
    }

    fn on_store_error(&mut self, lookup_id: u64, candidate: Id) {
        match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::Store { state, .. }) => state.flag_candidate_as_invalid(&candidate),
            _ => return,
        }

        self.try_store_phase(lookup_id);
    }

    /// Once every find-peer request of a save has completed, the closest
    /// responsive peers are known: push the value to them.
    fn try_store_phase(&mut self, lookup_id: u64) {
        let ready = match self.lookups.get(&lookup_id) {
            Some(Lookup::Store { state, .. }) => {
                !state.is_caller_notified() && state.have_all_requests_completed()
            }
            _ => false,
        };

        if ready {
            self.send_store_requests(lookup_id);
        }

        self.release_if_settled(lookup_id);
    }

    fn send_store_requests(&mut self, lookup_id: u64) {
        let (key, value, targets) = match self.lookups.get(&lookup_id) {
            Some(Lookup::Store { state, value, .. }) => (
                state.target(),
                value.clone(),
                state.select_closest_valid_candidates(REDUNDANT_SAVE_COUNT),
            ),
            _ => return,
        };

        debug!(key = %key, count = targets.len(), "sending store requests");
        for peer in targets {
            self.send_oneway_request(
                MessageBody::StoreRequest(StoreRequestArguments {
                    key,
                    value: value.clone(),
                }),
                peer.address(),
            );
        }

        // Storing is unacknowledged; the caller learns nothing more.
        self.notify_save(lookup_id, Ok(()));
    }

    fn notify_save(&mut self, lookup_id: u64, result: Result<(), Error>) {
        if let Some(Lookup::Store { state, handler, .. }) = self.lookups.get_mut(&lookup_id) {
            if state.mark_caller_notified() {
                if let Some(handler) = handler.take() {
                    handler(result);
                }
            }
        }
    }

    // --- Bucket refresh ---

    fn drive_refresh(&mut self, lookup_id: u64) {
        let Some((target, batch)) = self.select_batch(lookup_id) else {
            return;
        };
        let timeout = self.request_timeout;

        for peer in batch {
            trace!(target = %target, candidate = %peer.id(), "sending refresh request");
            let candidate = *peer.id();

            self.send_request(
                MessageBody::FindPeerRequest(FindPeerRequestArguments { target }),
                peer.address(),
                timeout,
                Box::new(move |engine, _from, body| {
                    engine.on_refresh_response(lookup_id, candidate, body)
                }),
                Box::new(move |engine, _error| engine.on_refresh_error(lookup_id, candidate)),
            );
        }
    }

    fn on_refresh_response(&mut self, lookup_id: u64, candidate: Id, body: MessageBody) {
        let drive = match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::Refresh { state }) => {
                state.flag_candidate_as_valid(&candidate);

                match body {
                    MessageBody::FindPeerResponse(args) => {
                        state.are_these_candidates_closest(args.peers)
                    }
                    _ => false,
                }
            }
            _ => return,
        };

        if drive {
            self.drive_refresh(lookup_id);
        }

        self.release_if_settled(lookup_id);
    }

    fn on_refresh_error(&mut self, lookup_id: u64, candidate: Id) {
        match self.lookups.get_mut(&lookup_id) {
            Some(Lookup::Refresh { state }) => state.flag_candidate_as_invalid(&candidate),
            _ => return,
        }

        self.drive_refresh(lookup_id);
        self.release_if_settled(lookup_id);
    }
}
