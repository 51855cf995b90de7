//! End-to-end startup: identity → mTLS → chain → listeners.

use std::time::{Duration, Instant};

use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use registry_k8s::grpc::DialOptions;
use registry_k8s::identity::{SpiffeJwtGenerator, TokenGenerator};
use registry_k8s::lifecycle::startup::{self, StartupError};
use registry_k8s::lifecycle::{Shutdown, ShutdownCause};
use registry_k8s::net::{ListenUrl, ListenerError, MtlsConfig};
use registry_k8s::registry::HealthChain;

mod common;

fn client_dial(pki: &common::Pki) -> DialOptions {
    let source = pki.source("spiffe://example.org/forwarder");
    let tokens: std::sync::Arc<dyn TokenGenerator> = std::sync::Arc::new(
        SpiffeJwtGenerator::new(source.clone(), Duration::from_secs(60)),
    );
    DialOptions::new(&MtlsConfig::new(source), tokens).unwrap()
}

async fn check_health(dial: &DialOptions, target: &ListenUrl) -> i32 {
    let channel = dial.connect(target).await.unwrap();
    let mut client = HealthClient::new(channel);
    client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .status
}

#[tokio::test]
async fn serves_health_over_mtls_on_unix_and_tcp() {
    let pki = common::Pki::new();
    let dir = tempfile::tempdir().unwrap();
    let unix = ListenUrl::unix(dir.path().join("registry.sock"));
    let tcp = common::free_tcp_url();
    let config = common::config_for(vec![unix.clone(), tcp.clone()]);
    let shutdown = Shutdown::new();

    startup::start(
        &config,
        pki.source("spiffe://example.org/registry"),
        &HealthChain,
        &shutdown,
        Instant::now(),
    )
    .unwrap();

    let dial = client_dial(&pki);
    assert_eq!(check_health(&dial, &unix).await, ServingStatus::Serving as i32);
    assert_eq!(check_health(&dial, &tcp).await, ServingStatus::Serving as i32);

    shutdown.trigger(ShutdownCause::Signal("SIGTERM"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!dir.path().join("registry.sock").exists());
    assert_eq!(shutdown.exit_code(), 0);
}

#[tokio::test]
async fn peers_from_another_trust_domain_are_refused() {
    let pki = common::Pki::new();
    let tcp = common::free_tcp_url();
    let config = common::config_for(vec![tcp.clone()]);
    let shutdown = Shutdown::new();

    startup::start(
        &config,
        pki.source("spiffe://example.org/registry"),
        &HealthChain,
        &shutdown,
        Instant::now(),
    )
    .unwrap();

    let stranger = common::Pki::new();
    let dial = client_dial(&stranger);
    let result = tokio::time::timeout(Duration::from_secs(5), dial.connect(&tcp))
        .await
        .unwrap();
    assert!(result.is_err());
    shutdown.trigger(ShutdownCause::Signal("SIGTERM"));
}

#[tokio::test]
async fn second_of_three_addresses_in_use_fails_startup() {
    let pki = common::Pki::new();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = ListenUrl::tcp("127.0.0.1", occupied.local_addr().unwrap().port());
    let first = common::free_tcp_url();
    let config = common::config_for(vec![first.clone(), taken.clone(), common::free_tcp_url()]);
    let shutdown = Shutdown::new();

    let err = startup::start(
        &config,
        pki.source("spiffe://example.org/registry"),
        &HealthChain,
        &shutdown,
        Instant::now(),
    )
    .unwrap_err();

    match err {
        StartupError::Listener(ListenerError::Bind { address, source }) => {
            assert_eq!(address, taken);
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(shutdown.is_triggered());
    assert_eq!(shutdown.exit_code(), 1);

    // The first listener was started and stops with the lifetime.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(std::net::TcpListener::bind(first.host_port().unwrap()).is_ok());
}

#[tokio::test]
async fn lazy_channel_connects_on_first_call() {
    let pki = common::Pki::new();
    let tcp = common::free_tcp_url();
    let config = common::config_for(vec![tcp.clone()]);
    let shutdown = Shutdown::new();

    let server = startup::start(
        &config,
        pki.source("spiffe://example.org/registry"),
        &HealthChain,
        &shutdown,
        Instant::now(),
    )
    .unwrap();

    let channel = client_dial(&pki).connect_lazy(&tcp).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections().active_count(), 0);

    let status = HealthClient::new(channel)
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .status;
    assert_eq!(status, ServingStatus::Serving as i32);
    shutdown.trigger(ShutdownCause::Signal("SIGTERM"));
}
