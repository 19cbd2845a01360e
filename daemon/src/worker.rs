//! Background sync worker.
//!
//! One tokio task owns all background remote work for a coordinator: it
//! drains the change log on every interval tick and on explicit triggers,
//! applies push notifications from the remote service, and reboots channels
//! on request. Engine calls are synchronous and may block on the remote, so
//! each one runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use beancache_engine::{BeanId, Channel, Error, RemoteService, SyncCoordinator, SyncReport};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

/// The remote service reports that these beans changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTrigger {
    pub channel: Channel,
    pub ids: Vec<BeanId>,
}

impl PushTrigger {
    pub fn new<I, S>(channel: impl Into<Channel>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<BeanId>,
    {
        Self {
            channel: channel.into(),
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of applying one push trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    /// Ids whose local state changed
    pub applied: usize,
    /// Ids left alone by dirty precedence or already current
    pub unchanged: usize,
    /// Ids that could not be pulled or applied
    pub failed: usize,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Spawns the worker task.
pub struct SyncWorker {
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<dyn RemoteService>,
    interval: Duration,
    report_tx: watch::Sender<Option<SyncReport>>,
}

impl SyncWorker {
    /// Start the worker on the current tokio runtime.
    ///
    /// `remote` must be the service `coordinator` was built with; the worker
    /// pulls pushed ids through it.
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        remote: Arc<dyn RemoteService>,
        config: &DaemonConfig,
    ) -> WorkerHandle {
        let (report_tx, report_rx) = watch::channel(None);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (reboot_tx, reboot_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = SyncWorker {
            coordinator,
            remote,
            interval: config.sync_interval,
            report_tx,
        };
        let task = tokio::spawn(worker.run(trigger_rx, push_rx, reboot_rx, shutdown_rx));

        tracing::info!(interval_ms = config.sync_interval.as_millis() as u64, "Sync worker started");

        WorkerHandle {
            trigger_tx,
            push_tx,
            reboot_tx,
            shutdown_tx: Some(shutdown_tx),
            report_rx,
            task,
        }
    }

    async fn run(
        self,
        mut trigger_rx: mpsc::UnboundedReceiver<Reply<SyncReport>>,
        mut push_rx: mpsc::UnboundedReceiver<(PushTrigger, Reply<PushReport>)>,
        mut reboot_rx: mpsc::UnboundedReceiver<(Channel, Reply<usize>)>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                // Fires on explicit shutdown and when the handle is dropped.
                _ = &mut shutdown_rx => break,

                Some(reply) = trigger_rx.recv() => {
                    let _ = reply.send(self.sync().await);
                }

                Some((trigger, reply)) = push_rx.recv() => {
                    let _ = reply.send(Ok(self.apply_push(trigger).await));
                }

                Some((channel, reply)) = reboot_rx.recv() => {
                    let _ = reply.send(self.reboot(channel).await);
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        tracing::warn!(error = %e, "Scheduled sync failed");
                    }
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    async fn sync(&self) -> Result<SyncReport> {
        let coordinator = self.coordinator.clone();
        let report = tokio::task::spawn_blocking(move || coordinator.sync_pending()).await?;

        self.report_tx.send_replace(Some(report));
        Ok(report)
    }

    async fn apply_push(&self, trigger: PushTrigger) -> PushReport {
        let PushTrigger { channel, ids } = trigger;
        let results = join_all(ids.into_iter().map(|id| self.apply_one(channel.clone(), id))).await;

        let mut report = PushReport::default();
        for result in results {
            match result {
                Ok(true) => report.applied += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Failed to apply pushed change");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            channel = %channel,
            applied = report.applied,
            unchanged = report.unchanged,
            failed = report.failed,
            "Applied push trigger"
        );
        report
    }

    /// Pull one id and apply it as a remote update, or as a remote delete when
    /// the remote no longer has it.
    async fn apply_one(&self, channel: Channel, id: BeanId) -> Result<bool> {
        let coordinator = self.coordinator.clone();
        let remote = self.remote.clone();

        let changed = tokio::task::spawn_blocking(move || -> beancache_engine::Result<bool> {
            match remote.pull(&channel, &id).map_err(Error::from)? {
                Some(snapshot) => coordinator.apply_remote_update(&snapshot),
                None => coordinator.apply_remote_delete(&channel, &id),
            }
        })
        .await??;
        Ok(changed)
    }

    async fn reboot(&self, channel: Channel) -> Result<usize> {
        let coordinator = self.coordinator.clone();
        let count =
            tokio::task::spawn_blocking(move || coordinator.admin().reboot_channel(&channel))
                .await??;
        Ok(count)
    }
}

/// Controls a running [`SyncWorker`]. Dropping the handle stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    trigger_tx: mpsc::UnboundedSender<Reply<SyncReport>>,
    push_tx: mpsc::UnboundedSender<(PushTrigger, Reply<PushReport>)>,
    reboot_tx: mpsc::UnboundedSender<(Channel, Reply<usize>)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    report_rx: watch::Receiver<Option<SyncReport>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Run a sync pass now and wait for its report.
    pub async fn trigger_sync(&self) -> Result<SyncReport> {
        let (reply, rx) = oneshot::channel();
        self.trigger_tx
            .send(reply)
            .map_err(|_| DaemonError::WorkerStopped)?;
        rx.await.map_err(|_| DaemonError::WorkerStopped)?
    }

    /// Apply a push notification and wait for it to finish.
    pub async fn push(&self, trigger: PushTrigger) -> Result<PushReport> {
        let (reply, rx) = oneshot::channel();
        self.push_tx
            .send((trigger, reply))
            .map_err(|_| DaemonError::WorkerStopped)?;
        rx.await.map_err(|_| DaemonError::WorkerStopped)?
    }

    /// Clear and boot a channel again. Returns the number of beans loaded.
    pub async fn reboot(&self, channel: impl Into<Channel>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.reboot_tx
            .send((channel.into(), reply))
            .map_err(|_| DaemonError::WorkerStopped)?;
        rx.await.map_err(|_| DaemonError::WorkerStopped)?
    }

    /// Report of the most recent sync pass, if any has run.
    pub fn last_report(&self) -> Option<SyncReport> {
        *self.report_rx.borrow()
    }

    /// Wait until a sync pass finishes and return its report.
    pub async fn next_report(&mut self) -> Result<SyncReport> {
        self.report_rx
            .changed()
            .await
            .map_err(|_| DaemonError::WorkerStopped)?;
        let report = *self.report_rx.borrow_and_update();
        report.ok_or(DaemonError::WorkerStopped)
    }

    /// Stop the worker and wait for the task to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.await?;
        Ok(())
    }
}
