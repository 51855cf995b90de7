//! Multi-listener supervision.
//!
//! # Responsibilities
//! - Bind every configured address and start serving on it
//! - Give each listener its own single-slot error channel
//! - Turn the first listener error into a process shutdown
//!
//! # Design Decisions
//! - Binding is synchronous, so a bind failure is already in the channel
//!   when `listen_and_serve` returns
//! - Check-then-subscribe: a pending error is handled inline, otherwise
//!   exactly one watcher task awaits the channel
//! - A clean listener exit drops the sender; that is not an error

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::lifecycle::shutdown::{Shutdown, ShutdownCause};
use crate::net::{BoundListener, ListenUrl, ListenerError, ServeError};
use crate::observability::metrics;

/// Receives at most one terminal error from a listener.
pub type ErrorReceiver = oneshot::Receiver<ListenerError>;

/// Something that can serve on a bound listener until shutdown.
pub trait ListenerService: Send + Sync + 'static {
    /// Serve `listener` until `shutdown` fires or a fatal error occurs.
    fn serve(
        &self,
        listener: BoundListener,
        shutdown: Shutdown,
    ) -> BoxFuture<'static, Result<(), ServeError>>;
}

/// Bind `address` and serve on it in a background task.
///
/// A bind failure is sent on the returned channel before this returns.
pub fn listen_and_serve<S>(address: &ListenUrl, server: &S, shutdown: &Shutdown) -> ErrorReceiver
where
    S: ListenerService + ?Sized,
{
    let (errors, receiver) = oneshot::channel();

    let listener = match BoundListener::bind(address) {
        Ok(listener) => listener,
        Err(source) => {
            let _ = errors.send(ListenerError::Bind {
                address: address.clone(),
                source,
            });
            return receiver;
        }
    };

    tracing::info!(address = %address, "Listening");
    metrics::record_listener_started();

    let serve = server.serve(listener, shutdown.clone());
    let address = address.clone();
    tokio::spawn(async move {
        match serve.await {
            Ok(()) => tracing::debug!(address = %address, "Listener stopped"),
            Err(source) => {
                let _ = errors.send(ListenerError::Serve { address, source });
            }
        }
    });

    receiver
}

/// Shut down on the first error from `errors`.
///
/// An error already waiting is handled before returning and reported back.
/// Otherwise one watcher task is spawned to wait for it.
pub fn exit_on_err(mut errors: ErrorReceiver, shutdown: &Shutdown) -> Result<(), ListenerError> {
    match errors.try_recv() {
        Ok(err) => {
            fail(&err, shutdown);
            Err(err)
        }
        Err(TryRecvError::Closed) => Ok(()),
        Err(TryRecvError::Empty) => {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Ok(err) = errors.await {
                    fail(&err, &shutdown);
                }
            });
            Ok(())
        }
    }
}

/// Start every listener in order.
///
/// Returns as soon as all starts have been issued, without waiting for the
/// listeners to become ready. Stops at, and returns, the first error that
/// is already known.
pub fn start_all<S>(
    listeners: &[ListenUrl],
    server: &S,
    shutdown: &Shutdown,
) -> Result<(), ListenerError>
where
    S: ListenerService + ?Sized,
{
    for address in listeners {
        let errors = listen_and_serve(address, server, shutdown);
        exit_on_err(errors, shutdown)?;
    }
    Ok(())
}

fn fail(err: &ListenerError, shutdown: &Shutdown) {
    metrics::record_listener_failure();
    shutdown.trigger(ShutdownCause::ListenerFailed {
        address: err.address().clone(),
        error: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::lifecycle::shutdown::ShutdownState;

    /// Serves nothing until shutdown; optionally fails one address.
    #[derive(Default)]
    struct FakeServer {
        fail_on: Option<(ListenUrl, Duration)>,
        started: Arc<AtomicUsize>,
    }

    impl ListenerService for FakeServer {
        fn serve(
            &self,
            listener: BoundListener,
            shutdown: Shutdown,
        ) -> BoxFuture<'static, Result<(), ServeError>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let fail_after = match &self.fail_on {
                Some((address, after)) if address == listener.address() => Some(*after),
                _ => None,
            };
            Box::pin(async move {
                let _listener = listener;
                match fail_after {
                    Some(after) => {
                        tokio::time::sleep(after).await;
                        Err(ServeError::Accept(io::Error::other("accept failed")))
                    }
                    None => {
                        shutdown.cancelled().await;
                        Ok(())
                    }
                }
            })
        }
    }

    fn free_tcp_url() -> ListenUrl {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        ListenUrl::tcp("127.0.0.1", probe.local_addr().unwrap().port())
    }

    fn bind_failure(address: ListenUrl) -> ListenerError {
        ListenerError::Bind {
            address,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        }
    }

    #[test]
    fn pending_error_is_handled_without_awaiting() {
        // No runtime: handling must not spawn or await.
        let shutdown = Shutdown::new();
        let (tx, rx) = oneshot::channel();
        let address = ListenUrl::tcp("127.0.0.1", 5002);
        tx.send(bind_failure(address.clone())).unwrap();

        let err = exit_on_err(rx, &shutdown).unwrap_err();
        assert_eq!(err.address(), &address);
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.exit_code(), 1);
    }

    #[test]
    fn closed_channel_is_a_clean_exit() {
        let shutdown = Shutdown::new();
        let (tx, rx) = oneshot::channel::<ListenerError>();
        drop(tx);

        assert!(exit_on_err(rx, &shutdown).is_ok());
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn later_error_is_picked_up_by_watcher() {
        let shutdown = Shutdown::new();
        let (tx, rx) = oneshot::channel();
        exit_on_err(rx, &shutdown).unwrap();
        assert!(!shutdown.is_triggered());

        tx.send(bind_failure(ListenUrl::tcp("127.0.0.1", 1))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .unwrap();
        assert_eq!(shutdown.state(), ShutdownState::ShuttingDown);
    }

    #[tokio::test]
    async fn start_all_does_not_wait_for_listeners() {
        let shutdown = Shutdown::new();
        let server = FakeServer::default();
        let listeners = vec![free_tcp_url(), free_tcp_url(), free_tcp_url()];

        start_all(&listeners, &server, &shutdown).unwrap();
        assert_eq!(server.started.load(Ordering::SeqCst), 3);
        assert!(!shutdown.is_triggered());
        shutdown.trigger(ShutdownCause::Signal("SIGTERM"));
    }

    #[tokio::test]
    async fn second_of_three_in_use_fails_startup() {
        let shutdown = Shutdown::new();
        let server = FakeServer::default();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = ListenUrl::tcp("127.0.0.1", occupied.local_addr().unwrap().port());
        let listeners = vec![free_tcp_url(), taken.clone(), free_tcp_url()];

        let err = start_all(&listeners, &server, &shutdown).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert_eq!(err.address(), &taken);
        // The third listener was never started.
        assert_eq!(server.started.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.exit_code(), 1);
    }

    #[tokio::test]
    async fn any_listener_failing_cancels_lifetime() {
        for failing in 0..3 {
            let shutdown = Shutdown::new();
            let listeners = vec![free_tcp_url(), free_tcp_url(), free_tcp_url()];
            let server = FakeServer {
                fail_on: Some((listeners[failing].clone(), Duration::from_millis(20))),
                ..Default::default()
            };

            start_all(&listeners, &server, &shutdown).unwrap();
            tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
                .await
                .unwrap();
            match shutdown.cause() {
                Some(ShutdownCause::ListenerFailed { address, .. }) => {
                    assert_eq!(address, &listeners[failing])
                }
                other => panic!("unexpected cause {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn signal_racing_listener_error_cancels_once() {
        let shutdown = Shutdown::new();
        let address = free_tcp_url();
        let server = FakeServer {
            fail_on: Some((address.clone(), Duration::from_millis(5))),
            ..Default::default()
        };

        start_all(&[address], &server, &shutdown).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let signal_won = shutdown.trigger(ShutdownCause::Signal("SIGINT"));

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .unwrap();
        let cause = shutdown.cause().unwrap();
        assert_eq!(signal_won, matches!(cause, ShutdownCause::Signal(_)));
        assert_eq!(shutdown.exit_code(), cause.exit_code());
    }
}
