// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use cortex_protocol::Observation;

/// Capacity of the per-session ring of recent observations.
pub const RECENT_OBS_CAPACITY: usize = 32;

/// Mutable per-session record. Owned by exactly one worker; the store hands
/// out `Arc<Mutex<..>>` handles so the GC sweeper and introspection can read
/// it, but only the worker mutates it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    recent_obs: VecDeque<Observation>,
    pub processed_total: u64,
    pub error_total: u64,
}

impl SessionState {
    pub fn new(session_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_key: session_key.into(),
            created_at: now,
            last_active_at: now,
            recent_obs: VecDeque::with_capacity(RECENT_OBS_CAPACITY),
            processed_total: 0,
            error_total: 0,
        }
    }

    /// Record an inbox item: append to the ring, bump the processed counter
    /// and refresh activity.
    pub fn note_ingress(&mut self, obs: &Observation, now: DateTime<Utc>) {
        self.push_recent(obs.clone());
        self.processed_total += 1;
        self.last_active_at = now;
    }

    /// Record an outbound emit produced while handling an inbox item.
    pub fn note_emit(&mut self, obs: &Observation, now: DateTime<Utc>) {
        self.push_recent(obs.clone());
        self.last_active_at = now;
    }

    pub fn record_error(&mut self) {
        self.error_total += 1;
    }

    pub fn recent_obs(&self) -> impl Iterator<Item = &Observation> {
        self.recent_obs.iter()
    }

    pub fn recent_obs_snapshot(&self) -> Vec<Observation> {
        self.recent_obs.iter().cloned().collect()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_active_at
    }

    fn push_recent(&mut self, obs: Observation) {
        if self.recent_obs.len() == RECENT_OBS_CAPACITY {
            self.recent_obs.pop_front();
        }
        self.recent_obs.push_back(obs);
    }
}

/// Shared registry of live session states.
#[derive(Default)]
pub struct SessionStateStore {
    states: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<SessionState>> {
        let mut states = self.states.lock().unwrap();
        states
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(session_key, now))))
            .clone()
    }

    pub fn get(&self, session_key: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.states.lock().unwrap().get(session_key).cloned()
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.states.lock().unwrap().contains_key(session_key)
    }

    pub fn remove(&self, session_key: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.states.lock().unwrap().remove(session_key)
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().unwrap().is_empty()
    }

    /// Session keys idle beyond `idle_ttl`, excluding `protected` (the
    /// system session is never garbage collected).
    pub fn idle_sessions(
        &self,
        now: DateTime<Utc>,
        idle_ttl: Duration,
        protected: &str,
    ) -> Vec<String> {
        let states = self.states.lock().unwrap();
        let mut idle: Vec<String> = states
            .iter()
            .filter(|(key, _)| key.as_str() != protected)
            .filter(|(_, state)| state.lock().unwrap().idle_for(now) > idle_ttl)
            .map(|(key, _)| key.clone())
            .collect();
        idle.sort();
        idle
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

    fn msg(text: &str) -> Observation {
        Observation::new(
            "test_input",
            SourceKind::External,
            Actor::user("u1"),
            Payload::Message(MessagePayload::text(text)),
        )
    }

    #[test]
    fn ring_caps_at_capacity_and_keeps_newest() {
        let now = Utc::now();
        let mut state = SessionState::new("user:u1", now);
        for i in 0..(RECENT_OBS_CAPACITY + 4) {
            state.note_ingress(&msg(&format!("m{i}")), now);
        }
        assert_eq!(state.recent_obs().count(), RECENT_OBS_CAPACITY);
        assert_eq!(state.processed_total, (RECENT_OBS_CAPACITY + 4) as u64);
        let first = state.recent_obs().next().unwrap();
        assert_eq!(first.message().unwrap().text, "m4");
    }

    #[test]
    fn idle_sessions_skips_protected_and_fresh() {
        let store = SessionStateStore::new();
        let t0 = Utc::now();
        store.get_or_create("system", t0);
        store.get_or_create("user:idle", t0);
        let fresh = store.get_or_create("user:fresh", t0);

        let later = t0 + Duration::seconds(120);
        fresh.lock().unwrap().note_ingress(&msg("keepalive"), later);

        let idle = store.idle_sessions(later, Duration::seconds(60), "system");
        assert_eq!(idle, vec!["user:idle".to_string()]);
    }
}
