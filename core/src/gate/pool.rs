// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Mutex;

use cortex_protocol::Observation;

/// Bounded in-memory ring of sunk or dropped observations, kept only for
/// audit and introspection. Oldest entries are evicted first.
pub struct ObservationPool {
    capacity: usize,
    items: Mutex<VecDeque<Observation>>,
}

impl ObservationPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn ingest(&self, obs: Observation) {
        let mut items = self.items.lock().unwrap();
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(obs);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Observation> {
        self.items.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use cortex_protocol::Actor;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::Payload;
    use cortex_protocol::SourceKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let pool = ObservationPool::new(2);
        for text in ["a", "b", "c"] {
            pool.ingest(Observation::new(
                "t",
                SourceKind::External,
                Actor::user("u"),
                Payload::Message(MessagePayload::text(text)),
            ));
        }
        let items = pool.snapshot();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message().unwrap().text, "b");
        assert_eq!(items[1].message().unwrap().text, "c");
    }
}
