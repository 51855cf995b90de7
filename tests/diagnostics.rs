//! Diagnostics endpoint over a real socket.

use std::time::Duration;

use registry_k8s::diagnostics::{self, DiagnosticsState};
use registry_k8s::identity::SpiffeId;
use registry_k8s::lifecycle::{Shutdown, ShutdownCause};
use registry_k8s::net::ListenUrl;

#[tokio::test]
async fn status_and_graceful_stop() {
    let shutdown = Shutdown::new();
    let state = DiagnosticsState::new(shutdown.clone(), vec![ListenUrl::unix("/listen.on.socket")]);
    state.set_spiffe_id(SpiffeId::parse("spiffe://example.org/registry").unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(diagnostics::serve(listener, state));

    let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(status["spiffe_id"], "spiffe://example.org/registry");
    assert_eq!(status["listeners"][0], "unix:///listen.on.socket");

    shutdown.trigger(ShutdownCause::Signal("SIGTERM"));
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
