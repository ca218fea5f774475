// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Adapter contracts at the ingress boundary.
//!
//! Concrete adapters (terminal input, timers, chat bridges) live outside
//! the core; they only need `publish_nowait` on the bus. Active adapters
//! are polled by [`drive_active_adapter`], which converts poll errors into
//! `adapter_observe_error` alerts and honors nociception cooldowns.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use cortex_protocol::AlertSeverity;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::bus::InputBus;
use crate::nociception::Nociception;
use crate::nociception::make_pain_alert;
use crate::util::backoff;

/// Passive adapter lifecycle: the adapter owns its own production loop and
/// publishes straight onto the bus. Implementations live outside the core,
/// so the boundary accepts arbitrary errors.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, bus: Arc<InputBus>) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Active adapter: the core polls it. A failed poll must not escape; the
/// driver converts it into an alert.
#[async_trait]
pub trait ActiveAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn observe_once(&self) -> anyhow::Result<Vec<cortex_protocol::Observation>>;

    fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1)
    }
}

/// Poll loop for one active adapter. Pauses while nociception has the
/// adapter on cooldown; backs off with jitter after consecutive failures.
pub async fn drive_active_adapter(
    adapter: Arc<dyn ActiveAdapter>,
    bus: Arc<InputBus>,
    nociception: Arc<Mutex<Nociception>>,
    system_session_key: String,
    cancel: CancellationToken,
) {
    let mut failed_attempts: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let disabled = {
            let noci = nociception.lock().unwrap();
            noci.is_adapter_disabled(adapter.name(), Utc::now())
        };
        if disabled {
            debug!(adapter = adapter.name(), "adapter on cooldown, pausing");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(adapter.poll_interval()) => continue,
            }
        }

        match adapter.observe_once().await {
            Ok(batch) => {
                failed_attempts = 0;
                for obs in batch {
                    bus.publish_nowait(obs);
                }
            }
            Err(e) => {
                failed_attempts += 1;
                warn!(adapter = adapter.name(), "observe_once failed: {e:#}");
                let alert = make_pain_alert(
                    "adapter",
                    adapter.name(),
                    AlertSeverity::Medium,
                    format!("{e:#}"),
                    &system_session_key,
                );
                bus.publish_nowait(alert);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff(failed_attempts)) => {}
                }
                continue;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(adapter.poll_interval()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use cortex_protocol::Actor;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::Observation;
    use cortex_protocol::Payload;
    use cortex_protocol::SourceKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::CoreErr;

    struct FlakyAdapter {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl ActiveAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn observe_once(&self) -> anyhow::Result<Vec<Observation>> {
            let n = self.polls.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                Err(CoreErr::Adapter {
                    name: "flaky".to_string(),
                    message: "transient".to_string(),
                }
                .into())
            } else {
                Ok(vec![Observation::new(
                    "flaky",
                    SourceKind::External,
                    Actor::user("u1"),
                    Payload::Message(MessagePayload::text("tick")),
                )])
            }
        }

        fn poll_interval(&self) -> std::time::Duration {
            std::time::Duration::from_millis(5)
        }
    }

    #[tokio::test]
    async fn failed_poll_becomes_alert_then_recovers() {
        let bus = Arc::new(InputBus::new(16));
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive_active_adapter(
            Arc::new(FlakyAdapter {
                polls: AtomicUsize::new(0),
            }),
            bus.clone(),
            Arc::new(Mutex::new(Nociception::new())),
            "system".to_string(),
            cancel.clone(),
        ));

        // First published observation is the converted error alert.
        let alert = bus.recv().await.unwrap();
        assert_eq!(alert.alert().unwrap().alert_type, "adapter_observe_error");
        assert_eq!(alert.session_key.as_deref(), Some("system"));

        // The adapter keeps producing afterwards.
        let obs = bus.recv().await.unwrap();
        assert_eq!(obs.message().unwrap().text, "tick");

        cancel.cancel();
        driver.await.unwrap();
    }
}
