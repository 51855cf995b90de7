//! Signal-driven shutdown of a running registry.

use std::process::Command;
use std::time::{Duration, Instant};

use registry_k8s::lifecycle::{signals, startup, Shutdown, ShutdownCause, ShutdownState};
use registry_k8s::registry::HealthChain;

mod common;

#[tokio::test]
async fn interrupt_after_startup_cancels_with_zero_exit() {
    let pki = common::Pki::new();
    let config = common::config_for(vec![
        common::free_tcp_url(),
        common::free_tcp_url(),
        common::free_tcp_url(),
    ]);
    let shutdown = Shutdown::new();
    signals::spawn_termination_handler(shutdown.clone()).unwrap();

    startup::start(
        &config,
        pki.source("spiffe://example.org/registry"),
        &HealthChain,
        &shutdown,
        Instant::now(),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(shutdown.state(), ShutdownState::Running);

    let status = Command::new("kill")
        .args(["-INT", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
        .await
        .expect("shutdown was not triggered");
    shutdown.mark_stopped();

    assert_eq!(shutdown.cause(), Some(&ShutdownCause::Signal("SIGINT")));
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
    assert_eq!(shutdown.exit_code(), 0);
}
