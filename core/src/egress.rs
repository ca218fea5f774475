// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Egress hub: hands processed observations to registered output sinks.
//!
//! Sinks are optional collaborators (terminal printers, chat connectors).
//! Delivery failures are logged and counted; they never propagate back
//! into the engine.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use cortex_protocol::Observation;
use tracing::warn;

#[async_trait]
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, obs: &Observation) -> anyhow::Result<()>;
}

struct SinkEntry {
    sink: Arc<dyn OutputSink>,
    /// When set, only observations addressed to this session are delivered.
    target_session_key: Option<String>,
}

#[derive(Default)]
pub struct EgressHub {
    sinks: Mutex<Vec<SinkEntry>>,
    delivered_total: AtomicU64,
    failed_total: AtomicU64,
}

impl EgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn OutputSink>, target_session_key: Option<String>) {
        self.sinks.lock().unwrap().push(SinkEntry {
            sink,
            target_session_key,
        });
    }

    pub async fn dispatch(&self, obs: &Observation) {
        let sinks: Vec<Arc<dyn OutputSink>> = {
            let entries = self.sinks.lock().unwrap();
            entries
                .iter()
                .filter(|entry| match &entry.target_session_key {
                    Some(target) => obs.session_key.as_deref() == Some(target.as_str()),
                    None => true,
                })
                .map(|entry| entry.sink.clone())
                .collect()
        };

        for sink in sinks {
            match sink.deliver(obs).await {
                Ok(()) => {
                    self.delivered_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed_total.fetch_add(1, Ordering::Relaxed);
                    warn!(sink = sink.name(), "egress delivery failed: {e:#}");
                }
            }
        }
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}
