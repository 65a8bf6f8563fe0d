//! The flusher, the conflict resolver, the update subscriber and the
//! reclaimer.

use super::FolderBranchOps;
use crate::cancel::OpContext;
use crate::locks::LockState;
use anyhow::anyhow;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tlf_core::{MergeStatus, Revision, TlfError, TlfResult, classify};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

fn canceled(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(TlfError::Canceled))
}

impl FolderBranchOps {
    /// Starts the background tasks. They stop on [`shutdown`](Self::shutdown).
    pub fn spawn_background(self: &Arc<Self>) -> TlfResult<()> {
        let cr_rx = self
            .cr_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("background tasks of {} already started", self.tlf))?;
        let handles = [
            tokio::spawn(self.clone().run_flusher()),
            tokio::spawn(self.clone().run_resolver(cr_rx)),
            tokio::spawn(self.clone().run_update_subscriber()),
            tokio::spawn(self.clone().run_reclaimer()),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        debug!(tlf = %self.tlf, "background tasks started");
        Ok(())
    }

    /// Commits staged changes, stops the background tasks and waits for
    /// them. The result is that of the final commit.
    pub async fn shutdown(&self) -> TlfResult<()> {
        let res = self.sync_all(&OpContext::background()).await.map(|_| ());
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await
                && err.is_panic()
            {
                error!(tlf = %self.tlf, "background task panicked: {err}");
            }
        }
        info!(tlf = %self.tlf, "folder shut down");
        res
    }

    /// True if shutdown began before `d` elapsed.
    async fn sleep_or_shutdown(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(d) => false,
        }
    }

    async fn run_flusher(self: Arc<Self>) {
        let period = self.ctx.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ctx = OpContext::new(self.shutdown.child_token());
            match self.sync_all(&ctx).await {
                Ok(true) => debug!(tlf = %self.tlf, "flushed staged changes"),
                Ok(false) => {}
                Err(err) if canceled(&err) => {}
                Err(err) => error!(tlf = %self.tlf, "background flush failed: {err:#}"),
            }
        }
        debug!(tlf = %self.tlf, "flusher stopped");
    }

    async fn run_reclaimer(self: Arc<Self>) {
        let period = self.ctx.config.gc_period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ctx = OpContext::new(self.shutdown.child_token());
            match self.reclaim_quota(&ctx).await {
                Ok(Some(rev)) => debug!(tlf = %self.tlf, through = %rev, "background reclamation done"),
                Ok(None) => {}
                Err(err) if canceled(&err) => {}
                Err(err) => warn!(tlf = %self.tlf, "background reclamation failed: {err:#}"),
            }
        }
        debug!(tlf = %self.tlf, "reclaimer stopped");
    }

    async fn run_resolver(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                req = requests.recv() => if req.is_none() { break },
            }
            let ctx = OpContext::new(self.shutdown.child_token());
            match self.resolve_conflicts(&ctx).await {
                Ok(()) => {}
                Err(err) if canceled(&err) => {}
                Err(err) => error!(tlf = %self.tlf, "conflict resolution failed: {err:#}"),
            }
        }
        debug!(tlf = %self.tlf, "resolver stopped");
    }

    /// The merged revision the server should notify us past.
    async fn update_watermark(&self) -> Revision {
        let lstate = LockState::new();
        let head = self.head.read(&lstate).await;
        match &head.head {
            Some(h) if h.merged_status() == MergeStatus::Merged => h.revision(),
            _ => head.latest_merged,
        }
    }

    async fn run_update_subscriber(self: Arc<Self>) {
        let backoff = self.ctx.config.flush_interval();
        loop {
            let current = self.update_watermark().await;
            let rx = match self.ctx.md_server.register_for_update(self.tlf, current).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(tlf = %self.tlf, "registering for updates failed: {err:#}");
                    if self.sleep_or_shutdown(backoff).await {
                        break;
                    }
                    continue;
                }
            };
            let fired = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                fired = rx => fired,
            };
            match fired {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(tlf = %self.tlf, "update registration failed: {err:#}");
                    if self.sleep_or_shutdown(backoff).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    debug!(tlf = %self.tlf, "update registration dropped");
                    if self.sleep_or_shutdown(backoff).await {
                        break;
                    }
                    continue;
                }
            }

            let ctx = OpContext::new(self.shutdown.child_token());
            match self.sync_from_server(&ctx).await {
                Ok(()) => {}
                Err(err) => match classify(&err) {
                    Some(TlfError::NoUpdatesWhileDirty(_) | TlfError::Unmerged { .. }) => {
                        debug!(tlf = %self.tlf, "deferring remote updates: {err}");
                        if self.sleep_or_shutdown(backoff).await {
                            break;
                        }
                    }
                    Some(TlfError::Canceled) => {}
                    _ => {
                        error!(tlf = %self.tlf, "applying remote updates failed: {err:#}");
                        if self.sleep_or_shutdown(backoff).await {
                            break;
                        }
                    }
                },
            }
        }
        debug!(tlf = %self.tlf, "update subscriber stopped");
    }
}
