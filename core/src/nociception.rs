//! Nociception: turns ALERT frequency into backpressure signals.
//!
//! Pain alerts are ordinary ALERT observations tagged with an aggregation
//! key (`<source_kind>:<source_id>`). The subsystem counts them per source
//! over a sliding window; a burst puts the offending adapter on cooldown.
//! Separately, bus drop growth across system-tick windows suppresses
//! system-session fan-out until the pressure subsides.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use cortex_protocol::Actor;
use cortex_protocol::AlertPayload;
use cortex_protocol::AlertSeverity;
use cortex_protocol::Observation;
use cortex_protocol::Payload;
use cortex_protocol::SourceKind;
use tracing::info;
use tracing::warn;

/// Same-source alerts within the window needed to trigger a cooldown.
pub const BURST_THRESHOLD: usize = 5;
pub const BURST_WINDOW_SEC: f64 = 60.0;
pub const ADAPTER_COOLDOWN_SEC: f64 = 60.0;

/// Bus drop growth per tick window that suppresses fan-out.
pub const DROP_BURST_THRESHOLD: u64 = 50;
pub const FANOUT_COOLDOWN_SEC: f64 = 60.0;

const PAIN_SOURCE_KEY: &str = "source";

/// Builder for pain-alert observations routed to the system session.
pub struct PainAlert {
    source_kind: String,
    source_id: String,
    severity: AlertSeverity,
    alert_type: String,
    message: Option<String>,
    data: HashMap<String, serde_json::Value>,
}

impl PainAlert {
    pub fn new(
        source_kind: impl Into<String>,
        alert_type: impl Into<String>,
        severity: AlertSeverity,
    ) -> Self {
        let alert_type = alert_type.into();
        Self {
            source_kind: source_kind.into(),
            source_id: alert_type.clone(),
            severity,
            alert_type,
            message: None,
            data: HashMap::new(),
        }
    }

    pub fn medium(source_kind: impl Into<String>, alert_type: impl Into<String>) -> Self {
        Self::new(source_kind, alert_type, AlertSeverity::Medium)
    }

    pub fn high(source_kind: impl Into<String>, alert_type: impl Into<String>) -> Self {
        Self::new(source_kind, alert_type, AlertSeverity::High)
    }

    /// Override the aggregation source id (defaults to the alert type).
    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn build(mut self, session_key: &str) -> Observation {
        self.data.insert(
            PAIN_SOURCE_KEY.to_string(),
            serde_json::Value::String(format!("{}:{}", self.source_kind, self.source_id)),
        );
        Observation::new(
            self.source_kind,
            SourceKind::Internal,
            Actor::system("system"),
            Payload::Alert(AlertPayload {
                alert_type: self.alert_type,
                severity: self.severity,
                message: self.message,
                data: self.data,
            }),
        )
        .with_session_key(session_key)
    }
}

/// Convenience constructor matching the adapter error contract.
pub fn make_pain_alert(
    source_kind: &str,
    source_id: &str,
    severity: AlertSeverity,
    message: impl Into<String>,
    session_key: &str,
) -> Observation {
    PainAlert::new(source_kind, "adapter_observe_error", severity)
        .source_id(source_id)
        .message(message)
        .build(session_key)
}

/// Recover the `<kind>:<id>` aggregation key from a pain alert.
pub fn extract_pain_key(obs: &Observation) -> Option<String> {
    let alert = obs.alert()?;
    match alert.data.get(PAIN_SOURCE_KEY) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NociceptionSnapshot {
    pub pain_total: u64,
    pub pain_by_source: HashMap<String, u64>,
    pub adapters_cooldown_total: u64,
    pub drops_overload_total: u64,
    pub adapters_disabled_until: HashMap<String, f64>,
    pub fanout_disabled_until: Option<f64>,
}

#[derive(Debug, Default)]
pub struct Nociception {
    pain_total: u64,
    pain_by_source: HashMap<String, u64>,
    windows: HashMap<String, VecDeque<f64>>,
    adapters_disabled_until: HashMap<String, f64>,
    adapters_cooldown_total: u64,
    fanout_disabled_until: Option<f64>,
    drops_overload_total: u64,
    drops_last_seen: u64,
}

impl Nociception {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one ALERT observation. Untagged alerts (no pain key) are
    /// counted but cannot trigger a source cooldown.
    pub fn on_alert(&mut self, obs: &Observation, now: DateTime<Utc>) {
        debug_assert!(obs.alert().is_some());
        self.pain_total += 1;

        let Some(key) = extract_pain_key(obs) else {
            return;
        };
        *self.pain_by_source.entry(key.clone()).or_insert(0) += 1;

        let now_ts = to_ts(now);
        let window = self.windows.entry(key.clone()).or_default();
        window.push_back(now_ts);
        let cutoff = now_ts - BURST_WINDOW_SEC;
        while window.front().is_some_and(|&first| first < cutoff) {
            window.pop_front();
        }

        if window.len() >= BURST_THRESHOLD {
            let source_id = key.split_once(':').map_or(key.as_str(), |(_, id)| id);
            let deadline = now_ts + ADAPTER_COOLDOWN_SEC;
            let already = self
                .adapters_disabled_until
                .get(source_id)
                .is_some_and(|&until| until > now_ts);
            if !already {
                warn!(source = %key, "pain burst, cooling adapter down");
                self.adapters_disabled_until
                    .insert(source_id.to_string(), deadline);
                self.adapters_cooldown_total += 1;
            }
        }
    }

    /// Feed the bus drop counter once per system-tick window.
    pub fn on_tick(&mut self, bus_dropped_total: u64, now: DateTime<Utc>) {
        let growth = bus_dropped_total.saturating_sub(self.drops_last_seen);
        self.drops_last_seen = bus_dropped_total;
        if growth >= DROP_BURST_THRESHOLD {
            info!(growth, "bus drop overload, suppressing fan-out");
            self.fanout_disabled_until = Some(to_ts(now) + FANOUT_COOLDOWN_SEC);
            self.drops_overload_total += 1;
        }
    }

    pub fn is_adapter_disabled(&self, source_id: &str, now: DateTime<Utc>) -> bool {
        self.adapters_disabled_until
            .get(source_id)
            .is_some_and(|&until| until > to_ts(now))
    }

    pub fn is_fanout_disabled(&self, now: DateTime<Utc>) -> bool {
        self.fanout_disabled_until
            .is_some_and(|until| until > to_ts(now))
    }

    pub fn snapshot(&self) -> NociceptionSnapshot {
        NociceptionSnapshot {
            pain_total: self.pain_total,
            pain_by_source: self.pain_by_source.clone(),
            adapters_cooldown_total: self.adapters_cooldown_total,
            drops_overload_total: self.drops_overload_total,
            adapters_disabled_until: self.adapters_disabled_until.clone(),
            fanout_disabled_until: self.fanout_disabled_until,
        }
    }
}

fn to_ts(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pain_key_round_trips_through_alert() {
        let pain = make_pain_alert(
            "adapter",
            "text_input",
            AlertSeverity::Low,
            "boom",
            "system",
        );
        assert_eq!(
            extract_pain_key(&pain),
            Some("adapter:text_input".to_string())
        );
        assert_eq!(pain.session_key.as_deref(), Some("system"));
    }

    #[test]
    fn pain_counts_aggregate_by_source() {
        let mut noci = Nociception::new();
        let now = Utc::now();
        for i in 0..3 {
            let pain = make_pain_alert(
                "adapter",
                "a1",
                AlertSeverity::Medium,
                format!("err {i}"),
                "system",
            );
            noci.on_alert(&pain, now);
        }
        let snap = noci.snapshot();
        assert_eq!(snap.pain_total, 3);
        assert_eq!(snap.pain_by_source["adapter:a1"], 3);
        assert!(snap.adapters_disabled_until.is_empty());
    }

    #[test]
    fn burst_triggers_adapter_cooldown() {
        let mut noci = Nociception::new();
        let t0 = Utc::now();
        for i in 0..BURST_THRESHOLD {
            let pain = make_pain_alert(
                "adapter",
                "a2",
                AlertSeverity::High,
                format!("burst {i}"),
                "system",
            );
            noci.on_alert(&pain, t0 + Duration::milliseconds(i as i64 * 10));
        }
        assert!(noci.is_adapter_disabled("a2", t0 + Duration::seconds(1)));
        assert!(!noci.is_adapter_disabled(
            "a2",
            t0 + Duration::seconds(ADAPTER_COOLDOWN_SEC as i64 + 5)
        ));
        assert_eq!(noci.snapshot().adapters_cooldown_total, 1);
    }

    #[test]
    fn spread_out_alerts_do_not_trigger() {
        let mut noci = Nociception::new();
        let t0 = Utc::now();
        for i in 0..(BURST_THRESHOLD * 2) {
            let pain =
                make_pain_alert("adapter", "a3", AlertSeverity::Low, "slow drip", "system");
            noci.on_alert(&pain, t0 + Duration::seconds(i as i64 * 30));
        }
        assert_eq!(noci.snapshot().adapters_cooldown_total, 0);
    }

    #[test]
    fn drop_growth_suppresses_fanout() {
        let mut noci = Nociception::new();
        let t0 = Utc::now();
        noci.on_tick(10, t0);
        assert!(!noci.is_fanout_disabled(t0));

        noci.on_tick(10 + DROP_BURST_THRESHOLD, t0 + Duration::seconds(1));
        assert!(noci.is_fanout_disabled(t0 + Duration::seconds(2)));
        assert_eq!(noci.snapshot().drops_overload_total, 1);

        // Flat drop counts release the suppression after the cooldown.
        let later = t0 + Duration::seconds(FANOUT_COOLDOWN_SEC as i64 + 5);
        assert!(!noci.is_fanout_disabled(later));
    }
}
