#![expect(clippy::unwrap_used)]

//! Idle-session garbage collection.

mod common;

use std::time::Duration;

use common::CountingOrchestrator;
use common::user_msg;
use cortex_core::Core;
use cortex_core::core::CoreOptions;

#[tokio::test]
async fn idle_sessions_are_collected_but_system_survives() {
    let orchestrator = CountingOrchestrator::new();
    let core = Core::builder()
        .options(CoreOptions {
            enable_session_gc: true,
            idle_ttl: Duration::from_millis(200),
            gc_sweep_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .orchestrator(orchestrator.clone())
        .build();
    core.start();

    // Touch the system session so it exists before the sweep.
    core.publish(
        user_msg("sys", "ignored").with_session_key("system"),
    );
    core.publish(user_msg("u2", "hello"));

    common::wait_until("session created", 2000, || core.has_session("user:u2")).await;

    common::wait_until("idle session collected", 3000, || {
        !core.has_session("user:u2") && core.metrics().snapshot().sessions_gc_total >= 1
    })
    .await;

    // The system session is never garbage collected.
    assert!(core.has_session("system"));
    assert!(
        !core
            .router()
            .list_active_sessions()
            .contains(&"user:u2".to_string())
    );

    // A returning user simply gets a fresh session.
    core.publish(user_msg("u2", "back again"));
    common::wait_until("session recreated", 2000, || core.has_session("user:u2")).await;

    core.shutdown().await.unwrap();
}
