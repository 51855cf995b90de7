//! OS signal handling.
//!
//! # Responsibilities
//! - SIGINT, SIGHUP, SIGTERM, SIGQUIT: trigger shutdown
//! - SIGUSR1: switch logging to TRACE
//! - SIGUSR2: restore the configured log level
//!
//! # Design Decisions
//! - Handlers are registered before the tasks are spawned, so a
//!   registration failure is reported to the caller
//! - Only the first termination signal picks the shutdown cause; a later
//!   one cuts the connection drain short

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

use crate::config::LogLevel;
use crate::lifecycle::shutdown::{Shutdown, ShutdownCause};
use crate::observability::LogLevelControl;

fn termination_signals() -> [(SignalKind, &'static str); 4] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::quit(), "SIGQUIT"),
    ]
}

/// Trigger `shutdown` on the first termination signal.
///
/// The task keeps listening once shutdown has begun, whatever started it.
/// The next termination signal completes the returned handle, which callers
/// treat as a request to stop waiting for open connections.
pub fn spawn_termination_handler(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut streams = Vec::new();
    for (kind, name) in termination_signals() {
        streams.push((signal(kind)?, name));
    }

    Ok(tokio::spawn(async move {
        tokio::select! {
            name = next_termination(&mut streams) => {
                shutdown.trigger(ShutdownCause::Signal(name));
            }
            () = shutdown.cancelled() => {}
        }

        let name = next_termination(&mut streams).await;
        tracing::warn!(signal = name, "Termination signal during shutdown, not waiting any longer");
    }))
}

async fn next_termination(streams: &mut [(Signal, &'static str)]) -> &'static str {
    let waits = streams.iter_mut().map(|(stream, name)| {
        Box::pin(async move {
            stream.recv().await;
            *name
        })
    });
    let (name, _, _) = futures_util::future::select_all(waits).await;
    name
}

/// Flip the log level on SIGUSR1/SIGUSR2 until shutdown.
pub fn spawn_log_level_handler(
    control: LogLevelControl,
    shutdown: Shutdown,
) -> io::Result<JoinHandle<()>> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = usr1.recv() => switch(&control, Some(LogLevel::Trace)),
                _ = usr2.recv() => switch(&control, None),
                () = shutdown.cancelled() => return,
            }
        }
    }))
}

fn switch(control: &LogLevelControl, level: Option<LogLevel>) {
    let result = match level {
        Some(level) => control.set_level(level),
        None => control.restore(),
    };
    match result {
        Ok(()) => tracing::info!(filter = ?control.current(), "Log level changed"),
        Err(e) => tracing::warn!(error = %e, "Failed to change log level"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raise(sig: i32) {
        let status = std::process::Command::new("kill")
            .arg(format!("-{sig}"))
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn first_signal_shuts_down_and_second_ends_the_handler() {
        let shutdown = Shutdown::new();
        let handler = spawn_termination_handler(shutdown.clone()).unwrap();

        raise(1); // SIGHUP
        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .unwrap();
        assert_eq!(shutdown.cause(), Some(&ShutdownCause::Signal("SIGHUP")));
        assert_eq!(shutdown.exit_code(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handler.is_finished());

        raise(1);
        tokio::time::timeout(Duration::from_secs(2), handler)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shutdown.cause(), Some(&ShutdownCause::Signal("SIGHUP")));
    }
}
