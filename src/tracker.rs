use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tokio::runtime::Handle;

use crate::{
    error::TrackerError,
    ipfs::IpfsClient,
    model::{Cid, Pin, PinInfo, TrackerStatus},
    optracker::{OperationTracker, OperationType, Phase},
    scheduler::Scheduler,
    settings::TrackerCfg,
};

/// Pin tracker that keeps no pin set of its own.
///
/// Only in-flight and settled operations from this process are remembered;
/// the daemon's pin list is the source of truth when reconciling.
pub struct PinTracker<C: IpfsClient + 'static> {
    ipfs: Arc<C>,
    optracker: Arc<OperationTracker>,
    scheduler: Scheduler<C>,
}

impl<C: IpfsClient + 'static> PinTracker<C> {
    /// Must be called from within a tokio runtime; workers are spawned on it.
    pub fn new(cfg: &TrackerCfg, ipfs: Arc<C>) -> Result<Self> {
        ensure!(cfg.concurrent_pins > 0, "concurrent_pins must be at least 1");
        let handle = Handle::try_current().context("pin tracker needs a tokio runtime")?;

        let optracker = Arc::new(OperationTracker::new());
        let scheduler = Scheduler::new(
            ipfs.clone(),
            optracker.clone(),
            cfg.concurrent_pins,
            handle,
        );
        tracing::debug!(concurrent_pins = cfg.concurrent_pins, "pin_tracker_started");
        Ok(Self {
            ipfs,
            optracker,
            scheduler,
        })
    }

    pub fn optracker(&self) -> &OperationTracker {
        &self.optracker
    }

    pub fn scheduler(&self) -> &Scheduler<C> {
        &self.scheduler
    }

    fn ensure_open(&self) -> Result<(), TrackerError> {
        if self.scheduler.is_closed() {
            return Err(TrackerError::ShutDown);
        }
        Ok(())
    }

    fn enqueue(&self, cid: &Cid, op_type: OperationType) -> Result<PinInfo, TrackerError> {
        let out = self.optracker.track_new_operation(cid, op_type);
        if let Some(op) = out.admitted {
            // lost a race with shutdown; submit already resolved the record
            if !self.scheduler.submit(op, out.priority) {
                return Err(TrackerError::ShutDown);
            }
        }
        Ok(out.info)
    }

    /// Starts pinning `pin.cid`. Returns as soon as the request is registered.
    pub fn track(&self, pin: Pin) -> Result<(), TrackerError> {
        let cid = pin.validate()?;
        self.ensure_open()?;
        tracing::debug!(%cid, name = ?pin.name, "track");
        self.enqueue(&cid, OperationType::Pin)?;
        Ok(())
    }

    /// Starts unpinning `cid`. Returns as soon as the request is registered.
    pub fn untrack(&self, cid: &str) -> Result<(), TrackerError> {
        let cid = Cid::parse(cid)?;
        self.ensure_open()?;
        tracing::debug!(%cid, "untrack");
        self.enqueue(&cid, OperationType::Unpin)?;
        Ok(())
    }

    pub fn status(&self, cid: &Cid) -> PinInfo {
        self.optracker.get(cid)
    }

    pub fn status_all(&self) -> Vec<PinInfo> {
        self.optracker
            .all()
            .iter()
            .map(|op| op.to_pin_info())
            .collect()
    }

    /// Checks every settled record against the daemon and corrects it.
    /// Queued and running operations are not touched. Returns the records
    /// whose status changed.
    pub async fn sync_all(&self) -> Result<Vec<PinInfo>, TrackerError> {
        self.ensure_open()?;
        let candidates = self.optracker.filter(&[Phase::Done, Phase::Error]);
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let listing = match self.ipfs.pin_ls_all().await {
            Ok(pins) => Some(pins),
            Err(e) => {
                tracing::warn!(error = ?e, "pin_ls_all_failed");
                None
            }
        };

        let mut changed = Vec::new();
        let mut failures = Vec::new();
        for op in candidates {
            let listed = listing
                .as_ref()
                .and_then(|pins| pins.get(op.cid().as_str()))
                .copied()
                .filter(|s| s.is_pinned());

            // Not in the listing is not proof of absence, ask for this cid.
            let remote = match listed {
                Some(s) => s,
                None => match self.ipfs.pin_ls_single(op.cid()).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(cid = %op.cid(), error = ?e, "pin_ls_single_failed");
                        failures.push((op.cid().clone(), format!("{e:#}")));
                        continue;
                    }
                },
            };

            if let Some(info) = self.optracker.reconcile(&op, remote) {
                tracing::info!(cid = %info.cid, from = %op.status(), to = %info.status, "status_reconciled");
                changed.push(info);
            }
        }

        if failures.is_empty() {
            Ok(changed)
        } else {
            Err(TrackerError::Sync {
                partial: changed,
                failures,
            })
        }
    }

    /// Single-cid form of [`sync_all`](Self::sync_all). Returns the current
    /// status whether or not it changed.
    pub async fn sync(&self, cid: &Cid) -> Result<PinInfo, TrackerError> {
        self.ensure_open()?;
        let Some(op) = self.optracker.get_operation(cid) else {
            return Ok(PinInfo::unpinned(cid.clone()));
        };
        if !op.phase().is_settled() {
            return Ok(op.to_pin_info());
        }

        let remote = self.ipfs.pin_ls_single(cid).await.map_err(|e| TrackerError::Sync {
            partial: vec![],
            failures: vec![(cid.clone(), format!("{e:#}"))],
        })?;
        Ok(self
            .optracker
            .reconcile(&op, remote)
            .unwrap_or_else(|| self.optracker.get(cid)))
    }

    /// Retries the failed operation for `cid`, if there is one.
    pub fn recover(&self, cid: &Cid) -> Result<PinInfo, TrackerError> {
        self.ensure_open()?;
        let info = self.optracker.get(cid);
        let info = match info.status {
            TrackerStatus::PinError => self.enqueue(cid, OperationType::Pin)?,
            TrackerStatus::UnpinError => self.enqueue(cid, OperationType::Unpin)?,
            _ => info,
        };
        tracing::debug!(%cid, status = %info.status, "recover");
        Ok(info)
    }

    pub fn recover_all(&self) -> Result<Vec<PinInfo>, TrackerError> {
        self.ensure_open()?;
        self.optracker
            .filter(&[Phase::Error])
            .iter()
            .map(|op| self.recover(op.cid()))
            .collect()
    }

    /// Cancels outstanding work and waits for workers to stop. Records that
    /// were queued fall back to their earlier state; running ones end up as
    /// `PinError`/`UnpinError`. Repeated calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        self.scheduler.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
