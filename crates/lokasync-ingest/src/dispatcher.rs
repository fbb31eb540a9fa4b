//! Hand-off from the network thread into the async runtime.
//!
//! The network thread pushes decoded events into an unbounded channel and
//! returns immediately. One long-lived task, spawned on the runtime captured
//! at startup, drains the channel and runs each event as its own task, so a
//! slow store write for one session never holds up another.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use lokasync_core::{targets, UpdateSession};

use crate::decoder::DecodedEvent;
use crate::error::Result;
use crate::pipeline::Pipeline;

/// Sender side, cloned into the network thread.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<DecodedEvent>,
}

impl DispatchHandle {
    /// Queue an event without blocking. Gives the event back if the
    /// dispatcher has shut down.
    pub fn submit(&self, event: DecodedEvent) -> std::result::Result<(), DecodedEvent> {
        self.tx.send(event).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of the dispatch task.
pub struct Dispatcher {
    handle: DispatchHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the dispatch task on `runtime`.
    pub fn spawn(runtime: &Handle, pipeline: Arc<Pipeline>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(run(rx, shutdown_rx, pipeline));

        Self {
            handle: DispatchHandle { tx },
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Stop accepting events, finish the ones already queued or running, and
    /// give up after `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => debug!(target: targets::SYSTEM, "Dispatcher drained"),
            Ok(Err(e)) => error!(target: targets::SYSTEM, error = %e, "Dispatcher task failed"),
            Err(_) => {
                warn!(
                    target: targets::SYSTEM,
                    timeout_ms = timeout.as_millis() as u64,
                    "Dispatcher did not drain in time, abandoning in-flight messages"
                );
                abort.abort();
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<DecodedEvent>,
    mut shutdown: oneshot::Receiver<()>,
    pipeline: Arc<Pipeline>,
) {
    let mut in_flight: JoinSet<Result<UpdateSession>> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => report(done),

            event = rx.recv() => match event {
                Some(event) => {
                    let pipeline = Arc::clone(&pipeline);
                    in_flight.spawn(async move { pipeline.process(event).await });
                }
                None => break,
            },
        }
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        let pipeline = Arc::clone(&pipeline);
        in_flight.spawn(async move { pipeline.process(event).await });
    }

    let pending = in_flight.len();
    if pending > 0 {
        info!(target: targets::SYSTEM, pending, "Waiting for in-flight messages");
    }
    while let Some(done) = in_flight.join_next().await {
        report(done);
    }
}

/// Completion callback for one message.
fn report(done: std::result::Result<Result<UpdateSession>, JoinError>) {
    match done {
        Ok(Ok(session)) => debug!(
            target: targets::MQTT,
            id = %session.id,
            flash_status = %session.flash_status,
            "Message processed"
        ),
        Ok(Err(e)) => error!(target: targets::MQTT, error = %e, "Log upsert failed"),
        Err(e) if e.is_panic() => error!(target: targets::MQTT, "Log upsert task panicked"),
        Err(e) => warn!(target: targets::MQTT, error = %e, "Log upsert task cancelled"),
    }
}
