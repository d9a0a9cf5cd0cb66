use std::io::Write;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use totem_cron::SchedulerHealth;
use totem_hooks::SchedulerEvent;

use crate::app::App;

/// Run the scheduler in the foreground until Ctrl+C or SIGTERM.
///
/// With `json`, every scheduler event is also written to stdout as one JSON
/// object per line.
pub async fn run_daemon(app: App, json: bool) -> Result<()> {
    let scheduler = app.scheduler();
    let shutdown = CancellationToken::new();

    let stream_done = CancellationToken::new();
    let event_stream =
        json.then(|| {
            tokio::spawn(stream_events(
                app.hooks.subscribe(),
                stream_done.clone(),
                std::io::stdout(),
            ))
        });

    let mut phase = scheduler.phase();
    tokio::spawn(async move {
        while phase.changed().await.is_ok() {
            let current = *phase.borrow_and_update();
            debug!(phase = ?current, "Scheduler phase");
        }
    });

    let mut health = scheduler.health();
    tokio::spawn(async move {
        while health.changed().await.is_ok() {
            let state = health.borrow_and_update().clone();
            match state {
                SchedulerHealth::Healthy => info!("Scheduler healthy"),
                SchedulerHealth::Degraded {
                    consecutive_failures,
                    last_error,
                } => warn!(consecutive_failures, %last_error, "Scheduler degraded"),
                SchedulerHealth::Starting | SchedulerHealth::Stopped => {}
            }
        }
    });

    let handle = tokio::spawn(scheduler.run(shutdown.clone()));

    shutdown_signal().await?;
    info!("Shutdown requested, waiting for running tasks");
    shutdown.cancel();
    handle.await.context("Scheduler task failed")?;
    stream_done.cancel();
    if let Some(stream) = event_stream {
        stream.await.context("Event stream task failed")?;
    }
    Ok(())
}

/// Write events as JSON lines until `done`, then flush the ones still queued.
async fn stream_events<W: Write>(
    mut events: broadcast::Receiver<SchedulerEvent>,
    done: CancellationToken,
    mut out: W,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = done.cancelled() => break,
        };
        match received {
            Ok(event) => {
                if !write_event(&mut out, &event) {
                    return;
                }
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event stream fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
    while let Ok(event) = events.try_recv() {
        if !write_event(&mut out, &event) {
            return;
        }
    }
}

/// Returns false once the output is gone.
fn write_event<W: Write>(out: &mut W, event: &SchedulerEvent) -> bool {
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to serialize scheduler event");
            return true;
        }
    };
    match writeln!(out, "{line}").and_then(|_| out.flush()) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Event stream closed");
            false
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
