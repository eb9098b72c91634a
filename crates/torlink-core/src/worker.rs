//! Retry worker.
//!
//! Everything the engine sends is persisted in the outbox first; this
//! worker is the backstop that keeps trying until the peer has it or the
//! attempt budget runs out. Each tick it:
//!
//! 1. demotes stale SENDING handshakes and fails their outbox items
//! 2. sweeps skipped keys past their TTL
//! 3. re-queues FAILED_TEMP downloads whose backoff elapsed
//! 4. drains due outbox items through the transport gate
//! 5. deletes delivered outbox items past their retention

use crate::context::EngineContext;
use crate::delivery::DeliveryMachine;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, HandshakeOutcome};
use crate::handshake::HandshakeEngine;
use crate::logging::RedactedOnion;
use crate::storage::{now, NewOutboxItem, OutboxKind, OutboxStatus, RequestStatus};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outbox items attempted per tick.
const DRAIN_BATCH: usize = 50;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Handshakes demoted to FAILED.
    pub demoted: usize,
    /// Skipped keys deleted.
    pub swept: usize,
    /// Downloads re-queued or timed out.
    pub downloads: usize,
    /// Outbox items delivered.
    pub delivered: usize,
    /// Outbox items attempted without success.
    pub deferred: usize,
}

/// Queue `item` and attempt it once right away.
///
/// The item is persisted before any network I/O; a failed attempt is left
/// to the worker. Returns true if the peer accepted it.
pub async fn send_now(ctx: &EngineContext, item: &NewOutboxItem) -> Result<bool> {
    let id = ctx.outbox().enqueue(item, now())?;
    if item.held {
        return Ok(false);
    }
    dispatch(ctx, id).await
}

/// Sends queued while handling an inbound frame.
///
/// Inbound handlers persist their replies and return them here instead of
/// sending inline, so the frame is answered before any outbound I/O
/// starts. [`FollowUps::run`] then attempts them in order; anything that
/// fails stays in the outbox for the worker.
#[derive(Debug, Default)]
#[must_use = "queued sends only leave the outbox when run"]
pub struct FollowUps {
    items: Vec<FollowUp>,
}

#[derive(Debug)]
enum FollowUp {
    Send(i64),
    /// A pong whose failure sends its inbox entry to backoff.
    Pong { entry_id: i64, item_id: i64 },
}

impl FollowUps {
    /// Attempt outbox item `item_id`.
    pub fn send(&mut self, item_id: i64) {
        self.items.push(FollowUp::Send(item_id));
    }

    /// Attempt the pong `item_id` for inbox entry `entry_id`.
    pub(crate) fn pong(&mut self, entry_id: i64, item_id: i64) {
        self.items.push(FollowUp::Pong { entry_id, item_id });
    }

    /// Number of queued sends.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Attempt every queued send once.
    pub async fn run(self, ctx: &EngineContext) -> Result<()> {
        for item in self.items {
            match item {
                FollowUp::Send(id) => {
                    dispatch(ctx, id).await?;
                }
                FollowUp::Pong { entry_id, item_id } => {
                    if !dispatch(ctx, item_id).await? {
                        DeliveryMachine::new(ctx.clone()).fail_download(entry_id)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Attempt one outbox item. Returns false if the attempt did not deliver
/// or another task already holds the item.
pub(crate) async fn dispatch(ctx: &EngineContext, id: i64) -> Result<bool> {
    let outbox = ctx.outbox();
    if !outbox.mark_sending(id, now())? {
        return Ok(false);
    }
    let item = outbox
        .get(id)?
        .ok_or_else(|| Error::NotFound(format!("outbox {}", id)))?;
    let request_id = match item.kind {
        OutboxKind::Handshake => item.request_id,
        _ => None,
    };
    match ctx.gate().send(&item.address, item.port, &item.frame).await {
        Ok(()) => {
            outbox.mark_delivered(id, now())?;
            if let Some(request_id) = request_id {
                ctx.requests()
                    .transition(request_id, &[RequestStatus::Sending], RequestStatus::Pending)?;
            }
            debug!(id, kind = ?item.kind, peer = %RedactedOnion(&item.address), "outbox item delivered");
            Ok(true)
        }
        Err(Error::InvalidPin) if request_id.is_some() => {
            outbox.mark_failed(id, now())?;
            if let Some(request_id) = request_id {
                ctx.requests().transition(
                    request_id,
                    &[RequestStatus::Sending, RequestStatus::Pending],
                    RequestStatus::InvalidPin,
                )?;
                ctx.emit(EngineEvent::Handshake {
                    request_id: Some(request_id),
                    outcome: HandshakeOutcome::InvalidPin,
                });
            }
            warn!(id, "peer could not open friend request with the PIN");
            Ok(false)
        }
        Err(e) => {
            let status = outbox.mark_retry(id, &ctx.config().retry, now())?;
            if status == OutboxStatus::Failed {
                warn!(id, kind = ?item.kind, error = %e, "giving up on outbox item");
                if let Some(request_id) = request_id {
                    ctx.requests().transition(
                        request_id,
                        &[RequestStatus::Sending, RequestStatus::Pending],
                        RequestStatus::Failed,
                    )?;
                }
            } else {
                debug!(id, kind = ?item.kind, error = %e, "send deferred");
            }
            Ok(false)
        }
    }
}

/// Periodic backstop for stalled sends and downloads.
#[derive(Debug, Clone)]
pub struct RetryWorker {
    ctx: EngineContext,
    handshake: HandshakeEngine,
    delivery: DeliveryMachine,
}

/// A running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker and wait for its current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "retry worker task failed");
        }
    }
}

impl RetryWorker {
    /// Worker over `ctx`.
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            handshake: HandshakeEngine::new(ctx.clone()),
            delivery: DeliveryMachine::new(ctx.clone()),
            ctx,
        }
    }

    /// Start the worker on the current runtime.
    pub fn spawn(ctx: EngineContext) -> WorkerHandle {
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(Self::new(ctx).run(shutdown));
        WorkerHandle { stop, task }
    }

    /// Tick until `shutdown` is set.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("retry worker started");
        match self.ctx.outbox().reset_in_flight(now()) {
            Ok(0) => {}
            Ok(n) => info!(items = n, "resuming sends interrupted by restart"),
            Err(e) => warn!(error = %e, "could not reset in-flight items"),
        }

        let period = Duration::from_secs(self.ctx.config().retry.interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = interval.tick() => {}
            }
            match self.run_once().await {
                Ok(report) if report != TickReport::default() => debug!(?report, "retry tick"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "retry tick failed"),
            }
        }
        info!("retry worker stopped");
    }

    /// One pass over every stalled item.
    pub async fn run_once(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let at = now();

        report.demoted = self.handshake.demote_stale()?.len();
        report.swept = self.ctx.keychain().sweep_skipped_keys(at)?;

        let cutoff = at - self.ctx.config().download_timeout_secs;
        for entry in self.ctx.inbox().in_flight()? {
            if entry.updated_at < cutoff && self.delivery.fail_download(entry.id)? {
                report.downloads += 1;
            }
        }
        for entry in self.ctx.inbox().due_retries(at)? {
            match self.delivery.retry_download(entry.id).await {
                Ok(()) => report.downloads += 1,
                Err(e) if e.is_locally_recovered() => {}
                Err(e) => warn!(entry_id = entry.id, error = %e, "download retry failed"),
            }
        }

        for item in self.ctx.outbox().due(at, DRAIN_BATCH)? {
            if dispatch(&self.ctx, item.id).await? {
                report.delivered += 1;
            } else {
                report.deferred += 1;
            }
        }

        self.ctx
            .outbox()
            .cleanup(at - self.ctx.config().outbox_retention_secs)?;
        Ok(report)
    }
}
