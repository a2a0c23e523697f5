//! Per-search state for iterative lookups.

use bytes::Bytes;

use crate::common::{Id, Peer};
use crate::{Error, Result};

/// Receives the outcome of an `async_load`: the value, or
/// [Error::ValueNotFound] once every candidate has been exhausted.
pub type LoadHandler = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Receives the outcome of an `async_save`. Storing is unacknowledged by the
/// protocol, so `Ok` means the store requests were handed to the closest
/// responsive peers.
pub type SaveHandler = Box<dyn FnOnce(Result<(), Error>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateStatus {
    /// Known but not yet queried.
    Unqueried,
    /// A request to this peer is outstanding.
    InFlight,
    /// The peer responded.
    Valid,
    /// The request to this peer timed out or failed to send.
    Invalid,
}

#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub peer: Peer,
    pub status: CandidateStatus,
}

/// The candidate set of one iterative lookup: peers ordered by XOR distance
/// to the target, an in-flight counter, and the notified-once latch for the
/// caller's handler.
pub(crate) struct CandidateSet {
    target: Id,
    candidates: Vec<Candidate>,
    in_flight: usize,
    notified: bool,
}

impl CandidateSet {
    pub fn new(target: Id, seeds: Vec<Peer>) -> Self {
        let mut set = CandidateSet {
            target,
            candidates: Vec::with_capacity(seeds.len()),
            in_flight: 0,
            notified: false,
        };

        for peer in seeds {
            set.insert(peer);
        }

        set
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn have_all_requests_completed(&self) -> bool {
        self.in_flight == 0
    }

    pub fn is_caller_notified(&self) -> bool {
        self.notified
    }

    // === Public Methods ===

    /// Picks up to `count` unqueried candidates closest to the target and
    /// marks them in flight.
    pub fn select_new_closest_candidates(&mut self, count: usize) -> Vec<Peer> {
        let mut selected = Vec::new();

        for candidate in self.candidates.iter_mut() {
            if selected.len() == count {
                break;
            }
            if candidate.status == CandidateStatus::Unqueried {
                candidate.status = CandidateStatus::InFlight;
                self.in_flight += 1;
                selected.push(candidate.peer);
            }
        }

        selected
    }

    /// The `count` candidates closest to the target whose peer responded.
    pub fn select_closest_valid_candidates(&self, count: usize) -> Vec<Peer> {
        self.candidates
            .iter()
            .filter(|candidate| candidate.status == CandidateStatus::Valid)
            .take(count)
            .map(|candidate| candidate.peer)
            .collect()
    }

    pub fn flag_candidate_as_valid(&mut self, id: &Id) {
        self.complete(id, CandidateStatus::Valid);
    }

    pub fn flag_candidate_as_invalid(&mut self, id: &Id) {
        self.complete(id, CandidateStatus::Invalid);
    }

    /// Merges newly discovered peers into the candidate set, deduplicated by
    /// id. Returns `true` iff at least one newly added candidate is strictly
    /// closer to the target than every in-flight or valid candidate, which is
    /// the signal that another round of requests is warranted.
    pub fn are_these_candidates_closest(&mut self, peers: Vec<Peer>) -> bool {
        let best = self.best_active_distance();
        let mut found_closer = false;

        for peer in peers {
            let distance = peer.id().xor(&self.target);
            if !self.insert(peer) {
                continue;
            }

            match &best {
                Some(best) if distance >= *best => {}
                _ => found_closer = true,
            }
        }

        found_closer
    }

    /// Latches the notified flag; `true` only on the first call.
    pub fn mark_caller_notified(&mut self) -> bool {
        if self.notified {
            return false;
        }

        self.notified = true;
        true
    }

    // === Private Methods ===

    fn insert(&mut self, peer: Peer) -> bool {
        if self.candidates.iter().any(|c| c.peer.id() == peer.id()) {
            return false;
        }

        let distance = peer.id().xor(&self.target);
        let position = self
            .candidates
            .partition_point(|c| c.peer.id().xor(&self.target) <= distance);

        self.candidates.insert(
            position,
            Candidate {
                peer,
                status: CandidateStatus::Unqueried,
            },
        );

        true
    }

    fn complete(&mut self, id: &Id, status: CandidateStatus) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.peer.id() == id && c.status == CandidateStatus::InFlight)
        {
            candidate.status = status;
            self.in_flight -= 1;
        }
    }

    /// Smallest XOR distance among in-flight and valid candidates.
    fn best_active_distance(&self) -> Option<Id> {
        self.candidates
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    CandidateStatus::InFlight | CandidateStatus::Valid
                )
            })
            .map(|c| c.peer.id().xor(&self.target))
            .min()
    }
}

/// One active iterative search owned by the engine, addressed by its lookup
/// id. Request callbacks capture the lookup id and the candidate id; the
/// engine releases the lookup when it is settled.
pub(crate) enum Lookup {
    /// `async_load`: FIND_VALUE driven, resolves to a value or not-found.
    FindValue {
        state: CandidateSet,
        handler: Option<LoadHandler>,
    },
    /// `async_save`: FIND_PEER driven; once the closest peers are known, the
    /// value is pushed to them with unacknowledged store requests.
    Store {
        state: CandidateSet,
        value: Bytes,
        handler: Option<SaveHandler>,
    },
    /// Background bucket refresh started after bootstrap; no caller handler.
    Refresh { state: CandidateSet },
}

impl Lookup {
    pub fn is_settled(&self) -> bool {
        match self {
            Lookup::FindValue { state, .. } | Lookup::Store { state, .. } => {
                state.is_caller_notified() && state.have_all_requests_completed()
            }
            Lookup::Refresh { state } => state.have_all_requests_completed(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::ID_SIZE;

    /// A peer whose distance to the all-zero target is the given first byte.
    fn peer_at(first_byte: u8) -> Peer {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = first_byte;
        bytes[ID_SIZE - 1] = 1;

        Peer::new(Id(bytes), ([127, 0, 0, 1], first_byte as u16 + 1))
    }

    fn target() -> Id {
        Id([0; ID_SIZE])
    }

    #[test]
    fn selection_is_closest_first() {
        let mut state = CandidateSet::new(
            target(),
            vec![peer_at(0x30), peer_at(0x10), peer_at(0x20), peer_at(0x40)],
        );

        let selected = state.select_new_closest_candidates(3);
        assert_eq!(
            selected.iter().map(|p| p.id().0[0]).collect::<Vec<_>>(),
            vec![0x10, 0x20, 0x30]
        );
        assert!(!state.have_all_requests_completed());

        // Selected candidates are not handed out twice.
        let selected = state.select_new_closest_candidates(3);
        assert_eq!(
            selected.iter().map(|p| p.id().0[0]).collect::<Vec<_>>(),
            vec![0x40]
        );
    }

    #[test]
    fn completion_accounting() {
        let mut state = CandidateSet::new(target(), vec![peer_at(0x10), peer_at(0x20)]);
        let selected = state.select_new_closest_candidates(2);

        state.flag_candidate_as_valid(selected[0].id());
        assert!(!state.have_all_requests_completed());

        state.flag_candidate_as_invalid(selected[1].id());
        assert!(state.have_all_requests_completed());

        // Repeated completion of the same candidate must not underflow.
        state.flag_candidate_as_valid(selected[0].id());
        assert!(state.have_all_requests_completed());
    }

    #[test]
    fn unqueried_candidates_are_not_flagged() {
        let mut state = CandidateSet::new(target(), vec![peer_at(0x10)]);

        state.flag_candidate_as_valid(peer_at(0x10).id());
        assert!(state.have_all_requests_completed());

        let selected = state.select_new_closest_candidates(1);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn merging_detects_strictly_closer_candidates() {
        let mut state = CandidateSet::new(target(), vec![peer_at(0x20)]);
        state.select_new_closest_candidates(1);

        // Farther peer: known territory, no new round warranted.
        assert!(!state.are_these_candidates_closest(vec![peer_at(0x30)]));
        // Duplicate of an existing candidate: ignored.
        assert!(!state.are_these_candidates_closest(vec![peer_at(0x20)]));
        // Strictly closer than every in-flight candidate.
        assert!(state.are_these_candidates_closest(vec![peer_at(0x10)]));

        let selected = state.select_new_closest_candidates(3);
        assert_eq!(
            selected.iter().map(|p| p.id().0[0]).collect::<Vec<_>>(),
            vec![0x10, 0x30]
        );
    }

    #[test]
    fn merging_with_no_active_candidates_warrants_a_round() {
        let mut state = CandidateSet::new(target(), vec![peer_at(0x10)]);
        let selected = state.select_new_closest_candidates(1);
        state.flag_candidate_as_invalid(selected[0].id());

        assert!(state.are_these_candidates_closest(vec![peer_at(0x50)]));
    }

    #[test]
    fn valid_candidates_are_selected_closest_first() {
        let mut state = CandidateSet::new(
            target(),
            vec![peer_at(0x10), peer_at(0x20), peer_at(0x30), peer_at(0x40)],
        );
        let selected = state.select_new_closest_candidates(4);

        for peer in &selected {
            state.flag_candidate_as_valid(peer.id());
        }
        state.are_these_candidates_closest(vec![peer_at(0x05)]);

        let closest = state.select_closest_valid_candidates(3);
        assert_eq!(
            closest.iter().map(|p| p.id().0[0]).collect::<Vec<_>>(),
            vec![0x10, 0x20, 0x30]
        );
    }

    #[test]
    fn the_caller_is_notified_once() {
        let mut state = CandidateSet::new(target(), vec![]);

        assert!(!state.is_caller_notified());
        assert!(state.mark_caller_notified());
        assert!(state.is_caller_notified());
        assert!(!state.mark_caller_notified());
    }
}
