//! Local storage for values accepted from the network.

use std::collections::HashMap;

use bytes::Bytes;

use crate::common::Id;

/// In-memory key to value map. Last writer wins; nothing is persisted across
/// restarts.
pub(crate) struct ValueStore {
    values: HashMap<Id, Bytes>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore {
            values: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: Id, value: Bytes) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &Id) -> Option<Bytes> {
        self.values.get(key).cloned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let mut store = ValueStore::new();
        let key = Id::random();

        store.put(key, Bytes::from_static(b"first"));
        store.put(key, Bytes::from_static(b"second"));

        assert_eq!(store.get(&key), Some(Bytes::from_static(b"second")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_keys_are_none() {
        let store = ValueStore::new();

        assert_eq!(store.get(&Id::random()), None);
    }
}
