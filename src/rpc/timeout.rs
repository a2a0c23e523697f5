//! Deadline bookkeeping for pending requests.

use std::collections::BTreeMap;
use std::mem;
use std::time::{Duration, Instant};

use super::Engine;

/// A deferred unit of work run on the engine thread.
pub(crate) type EngineTask = Box<dyn FnOnce(&mut Engine) + Send>;

/// Handle returned by [TimeoutManager::expires_from_now], used to cancel the
/// expiration before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutId {
    deadline: Instant,
    seq: u64,
}

/// An ordered set of expiration callbacks.
///
/// The single underlying timer is the engine loop's poll deadline: the loop
/// arms itself on [TimeoutManager::next_deadline] and drains everything due
/// with [TimeoutManager::pop_expired]. Expirations are delivered earliest
/// deadline first, ties broken by insertion order.
pub(crate) struct TimeoutManager {
    tasks: BTreeMap<(Instant, u64), EngineTask>,
    next_seq: u64,
}

impl TimeoutManager {
    pub fn new() -> Self {
        TimeoutManager {
            tasks: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Schedules `on_expiration` to run once `after` has elapsed.
    pub fn expires_from_now(&mut self, after: Duration, on_expiration: EngineTask) -> TimeoutId {
        let id = TimeoutId {
            deadline: Instant::now() + after,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.tasks.insert((id.deadline, id.seq), on_expiration);

        id
    }

    /// Removes a scheduled expiration. Returns `false` if it already fired or
    /// was cancelled before.
    pub fn cancel(&mut self, id: TimeoutId) -> bool {
        self.tasks.remove(&(id.deadline, id.seq)).is_some()
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every task whose deadline is at or before `now`,
    /// in delivery order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<EngineTask> {
        let pending = self.tasks.split_off(&(now, u64::MAX));
        let expired = mem::replace(&mut self.tasks, pending);

        expired.into_values().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn record(sender: &flume::Sender<u8>, value: u8) -> EngineTask {
        let sender = sender.clone();
        Box::new(move |_| {
            sender.send(value).unwrap();
        })
    }

    fn drain(engine: &mut Engine, tasks: Vec<EngineTask>) {
        for task in tasks {
            task(engine);
        }
    }

    #[test]
    fn expirations_fire_in_deadline_then_insertion_order() {
        let mut engine = super::super::test::test_engine();
        let (sender, receiver) = flume::unbounded();

        engine
            .timeouts
            .expires_from_now(Duration::from_millis(10), record(&sender, 3));
        engine
            .timeouts
            .expires_from_now(Duration::ZERO, record(&sender, 1));
        engine
            .timeouts
            .expires_from_now(Duration::ZERO, record(&sender, 2));

        let due = engine
            .timeouts
            .pop_expired(Instant::now() + Duration::from_secs(1));
        drain(&mut engine, due);

        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(engine.timeouts.len(), 0);
    }

    #[test]
    fn unexpired_tasks_stay_scheduled() {
        let mut engine = super::super::test::test_engine();
        let (sender, receiver) = flume::unbounded();

        engine
            .timeouts
            .expires_from_now(Duration::ZERO, record(&sender, 1));
        engine
            .timeouts
            .expires_from_now(Duration::from_secs(3600), record(&sender, 2));

        let due = engine.timeouts.pop_expired(Instant::now());
        drain(&mut engine, due);

        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![1]);
        assert_eq!(engine.timeouts.len(), 1);
        assert!(engine.timeouts.next_deadline().unwrap() > Instant::now());
    }

    #[test]
    fn cancelled_tasks_do_not_fire() {
        let mut engine = super::super::test::test_engine();
        let (sender, receiver) = flume::unbounded();

        let id = engine
            .timeouts
            .expires_from_now(Duration::ZERO, record(&sender, 1));
        engine
            .timeouts
            .expires_from_now(Duration::ZERO, record(&sender, 2));

        assert!(engine.timeouts.cancel(id));
        assert!(!engine.timeouts.cancel(id));

        let due = engine
            .timeouts
            .pop_expired(Instant::now() + Duration::from_secs(1));
        drain(&mut engine, due);

        assert_eq!(receiver.drain().collect::<Vec<_>>(), vec![2]);
    }
}
