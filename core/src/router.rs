// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Session routing: deterministic key resolution and per-session inboxes.
//!
//! The router owns a map of `session_key -> SessionInbox`. Each inbox is a
//! bounded FIFO with exactly one writer (the router) and one reader (the
//! session's worker). Enqueueing never blocks; a full inbox drops the
//! newest observation and counts it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use async_channel::TrySendError;
use cortex_protocol::Observation;
use cortex_protocol::ObservationType;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

/// How MESSAGE observations without an explicit session key are routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRouting {
    /// Route to `user:<actor_id>` when the actor id is non-empty.
    #[default]
    User,
    /// Route everything to the configured default session.
    Default,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub inbox_capacity: usize,
    pub system_session_key: String,
    pub default_session_key: String,
    pub message_routing: MessageRouting,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
            system_session_key: "system".to_string(),
            default_session_key: "default".to_string(),
            message_routing: MessageRouting::User,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxStats {
    pub enqueued: u64,
    pub dropped: u64,
}

/// Per-session bounded FIFO. One writer (router), one reader (worker).
pub struct SessionInbox {
    tx: Sender<Observation>,
    rx: Receiver<Observation>,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl SessionInbox {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue; `false` means the observation was dropped
    /// because the inbox was full (or its worker is gone).
    pub fn put_nowait(&self, obs: Observation) -> bool {
        match self.tx.try_send(obs) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub async fn recv(&self) -> Option<Observation> {
        self.rx.recv().await.ok()
    }

    pub fn close(&self) {
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> InboxStats {
        InboxStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Result of routing one observation.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub session_key: String,
    /// True when this dispatch created the session (first touch).
    pub created: bool,
    /// False when the inbox was full and the observation was dropped.
    pub accepted: bool,
}

/// Outcome of a targeted enqueue used by system-session fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutEnqueue {
    Enqueued,
    DroppedFull,
    NoSuchSession,
}

pub struct SessionRouter {
    options: RouterOptions,
    inboxes: Mutex<HashMap<String, Arc<SessionInbox>>>,
    dropped_total: AtomicU64,
}

impl SessionRouter {
    pub fn new(options: RouterOptions) -> Self {
        Self {
            options,
            inboxes: Mutex::new(HashMap::new()),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Deterministic session-key resolution:
    /// 1. an explicit `session_key` wins;
    /// 2. MESSAGEs go to `user:<actor_id>` (or the default session,
    ///    depending on `message_routing`);
    /// 3. everything else belongs to the system session.
    pub fn resolve_session_key(&self, obs: &Observation) -> String {
        if let Some(sk) = &obs.session_key
            && !sk.is_empty()
        {
            return sk.clone();
        }

        if obs.obs_type == ObservationType::Message {
            return match self.options.message_routing {
                MessageRouting::Default => self.options.default_session_key.clone(),
                MessageRouting::User => {
                    let actor_id = obs.actor.actor_id.trim();
                    if actor_id.is_empty() {
                        self.options.default_session_key.clone()
                    } else {
                        format!("user:{actor_id}")
                    }
                }
            };
        }

        self.options.system_session_key.clone()
    }

    /// Resolve, obtain-or-create the inbox, and enqueue without blocking.
    pub fn dispatch(&self, obs: Observation) -> Dispatch {
        let session_key = self.resolve_session_key(&obs);
        let (inbox, created) = self.get_or_create_inbox(&session_key);
        let accepted = inbox.put_nowait(obs);
        if !accepted {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            debug!(session_key = %session_key, "inbox full, dropping newest");
        }
        Dispatch {
            session_key,
            created,
            accepted,
        }
    }

    pub fn get_or_create_inbox(&self, session_key: &str) -> (Arc<SessionInbox>, bool) {
        let mut inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(session_key) {
            Some(inbox) => (inbox.clone(), false),
            None => {
                let inbox = Arc::new(SessionInbox::new(self.options.inbox_capacity));
                inboxes.insert(session_key.to_string(), inbox.clone());
                (inbox, true)
            }
        }
    }

    pub fn inbox(&self, session_key: &str) -> Option<Arc<SessionInbox>> {
        self.inboxes.lock().unwrap().get(session_key).cloned()
    }

    /// Enqueue into an existing session only; used by fan-out so it never
    /// conjures sessions into existence.
    pub fn enqueue_existing(&self, session_key: &str, obs: Observation) -> FanoutEnqueue {
        let Some(inbox) = self.inbox(session_key) else {
            return FanoutEnqueue::NoSuchSession;
        };
        if inbox.put_nowait(obs) {
            FanoutEnqueue::Enqueued
        } else {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            FanoutEnqueue::DroppedFull
        }
    }

    /// Stable sorted snapshot of active session keys.
    pub fn list_active_sessions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inboxes.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop the inbox and active flag. The worker reading the inbox sees
    /// end-of-stream once drained.
    pub fn remove_session(&self, session_key: &str) {
        if let Some(inbox) = self.inboxes.lock().unwrap().remove(session_key) {
            inbox.close();
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use cortex_protocol::Actor;
    use cortex_protocol::ControlPayload;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::Payload;
    use cortex_protocol::SourceKind;
    use pretty_assertions::assert_eq;

    use super::*;

    fn user_msg(actor_id: &str, text: &str) -> Observation {
        Observation::new(
            "text_input",
            SourceKind::External,
            Actor::user(actor_id),
            Payload::Message(MessagePayload::text(text)),
        )
    }

    fn control(kind: &str) -> Observation {
        Observation::new(
            "controller",
            SourceKind::Internal,
            Actor::system("system"),
            Payload::Control(ControlPayload {
                kind: kind.to_string(),
                data: Default::default(),
            }),
        )
    }

    #[test]
    fn explicit_session_key_wins() {
        let router = SessionRouter::new(RouterOptions::default());
        let obs = user_msg("u1", "hi").with_session_key("room:42");
        assert_eq!(router.resolve_session_key(&obs), "room:42");
    }

    #[test]
    fn message_routes_to_user_session() {
        let router = SessionRouter::new(RouterOptions::default());
        assert_eq!(router.resolve_session_key(&user_msg("u1", "hi")), "user:u1");
    }

    #[test]
    fn message_without_actor_falls_back_to_default() {
        let router = SessionRouter::new(RouterOptions::default());
        assert_eq!(router.resolve_session_key(&user_msg("", "hi")), "default");
    }

    #[test]
    fn message_routing_default_ignores_actor() {
        let router = SessionRouter::new(RouterOptions {
            message_routing: MessageRouting::Default,
            ..Default::default()
        });
        assert_eq!(router.resolve_session_key(&user_msg("u1", "hi")), "default");
    }

    #[test]
    fn non_message_routes_to_system_session() {
        let router = SessionRouter::new(RouterOptions::default());
        assert_eq!(router.resolve_session_key(&control("tick")), "system");
    }

    #[test]
    fn dispatch_creates_session_on_first_touch() {
        let router = SessionRouter::new(RouterOptions::default());
        let first = router.dispatch(user_msg("u1", "one"));
        assert!(first.created);
        assert!(first.accepted);
        let second = router.dispatch(user_msg("u1", "two"));
        assert!(!second.created);
        assert_eq!(router.list_active_sessions(), vec!["user:u1".to_string()]);
    }

    #[test]
    fn full_inbox_drops_newest_and_keeps_oldest() {
        let router = SessionRouter::new(RouterOptions {
            inbox_capacity: 1,
            ..Default::default()
        });
        assert!(router.dispatch(user_msg("u1", "oldest")).accepted);
        assert!(!router.dispatch(user_msg("u1", "newest")).accepted);
        assert_eq!(router.dropped_total(), 1);

        let inbox = router.inbox("user:u1").unwrap();
        assert_eq!(inbox.stats().dropped, 1);
        let kept = inbox.rx.try_recv().unwrap();
        assert_eq!(kept.message().unwrap().text, "oldest");
    }

    #[test]
    fn remove_session_closes_inbox() {
        let router = SessionRouter::new(RouterOptions::default());
        router.dispatch(user_msg("u1", "hi"));
        router.remove_session("user:u1");
        assert!(router.list_active_sessions().is_empty());
        assert_eq!(
            router.enqueue_existing("user:u1", user_msg("u1", "late")),
            FanoutEnqueue::NoSuchSession
        );
    }
}
