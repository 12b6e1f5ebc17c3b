//! Registry of in-flight and settled pin operations, one per CID.
//!
//! Every mutation happens under a single lock so that a CID never has two live
//! operations. Callers get clones; the map itself never leaves this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio_util::sync::CancellationToken;

use crate::model::{Cid, PinInfo, RemotePinStatus, TrackerStatus};

const SHUTDOWN_ERROR: &str = "cancelled by shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Pin,
    Unpin,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pin => f.write_str("pin"),
            Self::Unpin => f.write_str("unpin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    InProgress,
    Done,
    Error,
}

impl Phase {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Settled state an operation replaced. Unpin/Done stands for "not tracked".
#[derive(Debug, Clone)]
struct Settled {
    op_type: OperationType,
    phase: Phase,
    error: Option<String>,
    ts: DateTime<Utc>,
}

impl Settled {
    fn done(op_type: OperationType) -> Self {
        Self {
            op_type,
            phase: Phase::Done,
            error: None,
            ts: Utc::now(),
        }
    }

    fn is_unpinned(&self) -> bool {
        self.op_type == OperationType::Unpin && self.phase == Phase::Done
    }
}

/// A pin or unpin for one CID.
///
/// `token` is live while the operation is queued or running and is cancelled
/// once it settles or is superseded. `exited` fires when the worker that picked
/// the operation up has fully let go of it; an operation waits on every token
/// in `after` before talking to the daemon.
///
/// `prior` is the settled record this operation replaced, restored if the
/// operation is cancelled before it runs. `supersedes` marks an operation that
/// replaced a running one.
#[derive(Debug, Clone)]
pub struct Operation {
    id: u64,
    cid: Cid,
    op_type: OperationType,
    phase: Phase,
    error: Option<String>,
    ts: DateTime<Utc>,
    token: CancellationToken,
    exited: CancellationToken,
    after: Vec<CancellationToken>,
    prior: Option<Settled>,
    supersedes: bool,
}

impl Operation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn exited(&self) -> &CancellationToken {
        &self.exited
    }

    pub(crate) fn after(&self) -> &[CancellationToken] {
        &self.after
    }

    pub fn status(&self) -> TrackerStatus {
        use OperationType::*;
        use Phase::*;
        match (self.op_type, self.phase) {
            (Pin, Queued) => TrackerStatus::PinQueued,
            (Pin, InProgress) => TrackerStatus::Pinning,
            (Pin, Done) => TrackerStatus::Pinned,
            (Pin, Error) => TrackerStatus::PinError,
            (Unpin, Queued) => TrackerStatus::UnpinQueued,
            (Unpin, InProgress) => TrackerStatus::Unpinning,
            (Unpin, Done) => TrackerStatus::Unpinned,
            (Unpin, Error) => TrackerStatus::UnpinError,
        }
    }

    pub fn to_pin_info(&self) -> PinInfo {
        PinInfo {
            cid: self.cid.clone(),
            status: self.status(),
            error: self.error.clone(),
            ts: self.ts,
        }
    }

    fn settle(&mut self, phase: Phase, error: Option<String>) {
        self.phase = phase;
        self.error = error;
        self.ts = Utc::now();
        self.token.cancel();
    }

    fn settled_state(&self) -> Settled {
        Settled {
            op_type: self.op_type,
            phase: self.phase,
            error: self.error.clone(),
            ts: self.ts,
        }
    }

    /// What the CID looked like before this (never started) operation.
    fn pre_operation_state(&self) -> Settled {
        self.prior.clone().unwrap_or_else(|| match self.op_type {
            // never pinned, nothing to undo
            OperationType::Pin => Settled::done(OperationType::Unpin),
            // never unpinned, so it is still pinned
            OperationType::Unpin => Settled::done(OperationType::Pin),
        })
    }

    /// Exit signals that have not fired yet, this operation's own included.
    fn pending(&self) -> Vec<CancellationToken> {
        std::iter::once(&self.exited)
            .chain(&self.after)
            .filter(|t| !t.is_cancelled())
            .cloned()
            .collect()
    }
}

/// Result of registering a request with [`OperationTracker::track_new_operation`].
#[derive(Debug)]
pub struct TrackOutcome {
    /// State of the CID after the request was applied.
    pub info: PinInfo,
    /// Work the scheduler must run, if the request produced any.
    pub admitted: Option<Operation>,
    /// Set when `admitted` replaces a running operation and should jump the queue.
    pub priority: bool,
    /// Token of the operation this request cancelled.
    pub superseded: Option<CancellationToken>,
}

impl TrackOutcome {
    fn noop(info: PinInfo) -> Self {
        Self {
            info,
            admitted: None,
            priority: false,
            superseded: None,
        }
    }
}

fn expired() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

#[derive(Default)]
struct Registry {
    ops: HashMap<Cid, Operation>,
    /// Exit signals of workers whose record is gone but which may still be
    /// unwinding. The next operation for the CID waits on them.
    unwinding: HashMap<Cid, Vec<CancellationToken>>,
}

impl Registry {
    fn stash(&mut self, cid: &Cid, tokens: Vec<CancellationToken>) {
        self.unwinding.retain(|_, ts| {
            ts.retain(|t| !t.is_cancelled());
            !ts.is_empty()
        });
        if !tokens.is_empty() {
            self.unwinding.entry(cid.clone()).or_default().extend(tokens);
        }
    }

    fn remove(&mut self, cid: &Cid) {
        if let Some(op) = self.ops.remove(cid) {
            self.stash(cid, op.pending());
        }
    }

    /// Everything a new operation for `cid` has to wait for.
    fn pending(&mut self, cid: &Cid) -> Vec<CancellationToken> {
        let mut out = self.ops.get(cid).map(Operation::pending).unwrap_or_default();
        if let Some(ts) = self.unwinding.remove(cid) {
            out.extend(ts.into_iter().filter(|t| !t.is_cancelled()));
        }
        out
    }
}

#[derive(Default)]
pub struct OperationTracker {
    reg: Mutex<Registry>,
    next_id: AtomicU64,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.reg.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_operation(
        &self,
        cid: &Cid,
        op_type: OperationType,
        after: Vec<CancellationToken>,
        prior: Option<Settled>,
    ) -> Operation {
        Operation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            cid: cid.clone(),
            op_type,
            phase: Phase::Queued,
            error: None,
            ts: Utc::now(),
            token: CancellationToken::new(),
            exited: CancellationToken::new(),
            after,
            prior,
            supersedes: false,
        }
    }

    fn admit(
        &self,
        reg: &mut Registry,
        cid: &Cid,
        op_type: OperationType,
        prior: Option<Settled>,
        supersedes: bool,
    ) -> TrackOutcome {
        let after = reg.pending(cid);
        let mut op = self.new_operation(cid, op_type, after, prior);
        op.supersedes = supersedes;
        let info = op.to_pin_info();
        reg.ops.insert(cid.clone(), op.clone());
        TrackOutcome {
            info,
            admitted: Some(op),
            priority: supersedes,
            superseded: None,
        }
    }

    /// Replaces the record for `cid` with the settled `state`.
    fn restore(&self, reg: &mut Registry, cid: &Cid, state: Settled) -> PinInfo {
        let after = reg.pending(cid);
        if state.is_unpinned() {
            reg.ops.remove(cid);
            reg.stash(cid, after);
            return PinInfo::unpinned(cid.clone());
        }
        let mut op = self.new_operation(cid, state.op_type, after, None);
        op.phase = state.phase;
        op.error = state.error;
        op.ts = state.ts;
        op.token = expired();
        op.exited = expired();
        let info = op.to_pin_info();
        reg.ops.insert(cid.clone(), op);
        info
    }

    /// Settles a queued or running record whose work will never happen.
    fn resolve_abandoned(&self, reg: &mut Registry, cid: &Cid) {
        let Some(op) = reg.ops.get(cid).cloned() else {
            return;
        };
        if op.phase.is_settled() {
            return;
        }
        op.token.cancel();
        if op.phase == Phase::Queued && !op.supersedes {
            op.exited.cancel();
            self.restore(reg, cid, op.pre_operation_state());
        } else if let Some(cur) = reg.ops.get_mut(cid) {
            cur.settle(Phase::Error, Some(SHUTDOWN_ERROR.to_string()));
        }
    }

    /// Registers a pin or unpin request for `cid`, cancelling or replacing
    /// whatever contradicts it.
    pub fn track_new_operation(&self, cid: &Cid, op_type: OperationType) -> TrackOutcome {
        let mut reg = self.lock();

        let Some(existing) = reg.ops.get(cid).cloned() else {
            return self.admit(&mut reg, cid, op_type, None, false);
        };

        if existing.op_type == op_type && !existing.phase.is_settled() {
            tracing::debug!(%cid, op = %op_type, "operation_already_tracked");
            return TrackOutcome::noop(existing.to_pin_info());
        }

        let superseded = Some(existing.token.clone());
        match existing.phase {
            Phase::Queued => {
                existing.token.cancel();
                // never picked up, so only its own predecessors are left to wait on
                existing.exited.cancel();

                if existing.supersedes {
                    // It was replacing a running operation whose outcome is
                    // unknown, so the requested direction still has to run.
                    let mut out = self.admit(&mut reg, cid, op_type, None, true);
                    out.superseded = superseded;
                    tracing::debug!(%cid, op = %op_type, "queued_replacement_superseded");
                    return out;
                }

                let state = existing.pre_operation_state();
                if state.op_type == op_type {
                    let info = self.restore(&mut reg, cid, state);
                    tracing::debug!(%cid, cancelled = %existing.op_type, status = %info.status, "queued_operation_cancelled");
                    return TrackOutcome {
                        info,
                        admitted: None,
                        priority: false,
                        superseded,
                    };
                }

                // The record it replaced contradicts the request, e.g. pinned
                // before a re-track that is now being untracked.
                let mut out = self.admit(&mut reg, cid, op_type, Some(state), false);
                out.superseded = superseded;
                tracing::debug!(%cid, cancelled = %existing.op_type, op = %op_type, "queued_operation_replaced");
                out
            }
            Phase::InProgress => {
                existing.token.cancel();
                let mut out = self.admit(&mut reg, cid, op_type, None, true);
                out.superseded = superseded;
                tracing::debug!(%cid, cancelled = %existing.op_type, op = %op_type, "in_flight_operation_superseded");
                out
            }
            // A settled record's worker may still be unwinding (set_error
            // cancels running operations); admit waits for it.
            Phase::Done | Phase::Error => {
                self.admit(&mut reg, cid, op_type, Some(existing.settled_state()), false)
            }
        }
    }

    /// Snapshot of `cid`; `Unpinned` when nothing is tracked.
    pub fn get(&self, cid: &Cid) -> PinInfo {
        self.lock()
            .ops
            .get(cid)
            .map(Operation::to_pin_info)
            .unwrap_or_else(|| PinInfo::unpinned(cid.clone()))
    }

    pub fn get_operation(&self, cid: &Cid) -> Option<Operation> {
        self.lock().ops.get(cid).cloned()
    }

    /// Token of the current operation for `cid`, already cancelled when
    /// nothing is tracked.
    pub fn op_context(&self, cid: &Cid) -> CancellationToken {
        self.lock()
            .ops
            .get(cid)
            .map(|op| op.token.clone())
            .unwrap_or_else(expired)
    }

    /// Forces the operation for `cid` into its direction's error state. A
    /// running operation is cancelled and will not overwrite the error.
    pub fn set_error(&self, cid: &Cid, err: &str) {
        if let Some(op) = self.lock().ops.get_mut(cid) {
            op.settle(Phase::Error, Some(err.to_string()));
        }
    }

    /// Drops a settled record. Queued and running operations are kept.
    pub fn clean(&self, cid: &Cid) -> bool {
        let mut reg = self.lock();
        match reg.ops.get(cid) {
            Some(op) if op.phase.is_settled() => {
                reg.remove(cid);
                true
            }
            _ => false,
        }
    }

    pub fn all(&self) -> Vec<Operation> {
        let mut out: Vec<Operation> = self.lock().ops.values().cloned().collect();
        out.sort_by(|a, b| a.cid.cmp(&b.cid));
        out
    }

    pub fn filter(&self, phases: &[Phase]) -> Vec<Operation> {
        let mut out: Vec<Operation> = self
            .lock()
            .ops
            .values()
            .filter(|op| phases.contains(&op.phase))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.cid.cmp(&b.cid));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ops.is_empty()
    }

    /// Moves `op` from queued to in progress. False when it was superseded,
    /// errored or cancelled in the meantime.
    pub(crate) fn start(&self, op: &Operation) -> bool {
        let mut reg = self.lock();
        match reg.ops.get_mut(&op.cid) {
            Some(cur) if cur.id == op.id && cur.phase == Phase::Queued && !cur.token.is_cancelled() => {
                cur.phase = Phase::InProgress;
                cur.ts = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Records the outcome of the remote call for `op`. Stale operations are
    /// ignored.
    pub(crate) fn finish(&self, op: &Operation, result: Result<(), String>) {
        let mut reg = self.lock();
        let Some(cur) = reg.ops.get_mut(&op.cid) else {
            return;
        };
        if cur.id != op.id || cur.phase != Phase::InProgress {
            return;
        }
        match (result, cur.op_type) {
            (Ok(()), OperationType::Unpin) => {
                cur.token.cancel();
                reg.remove(&op.cid);
            }
            (Ok(()), OperationType::Pin) => cur.settle(Phase::Done, None),
            (Err(e), _) => cur.settle(Phase::Error, Some(e)),
        }
    }

    /// Aligns a settled record with the daemon's view. Returns the new state if
    /// it changed. Records that moved on since `op` was read are left alone.
    pub(crate) fn reconcile(&self, op: &Operation, remote: RemotePinStatus) -> Option<PinInfo> {
        let mut reg = self.lock();
        let cur = reg.ops.get_mut(&op.cid)?;
        if cur.id != op.id || !cur.phase.is_settled() || cur.phase != op.phase {
            return None;
        }

        if remote.is_pinned() {
            if cur.status() == TrackerStatus::Pinned {
                return None;
            }
            cur.op_type = OperationType::Pin;
            cur.settle(Phase::Done, None);
            return Some(cur.to_pin_info());
        }

        reg.remove(&op.cid);
        Some(PinInfo::unpinned(op.cid.clone()))
    }

    /// Resolves `op` if the scheduler refused it. Queued work falls back to
    /// the state before it was requested.
    pub(crate) fn abandon(&self, op: &Operation) {
        let mut reg = self.lock();
        if reg.ops.get(&op.cid).is_some_and(|cur| cur.id == op.id) {
            self.resolve_abandoned(&mut reg, &op.cid);
        }
    }

    /// Cancels every queued or running operation and settles its record:
    /// queued work falls back to the state before it was requested, running
    /// work is marked failed.
    pub(crate) fn cancel_all(&self) {
        let mut reg = self.lock();
        let active: Vec<Cid> = reg
            .ops
            .values()
            .filter(|op| !op.phase.is_settled())
            .map(|op| op.cid.clone())
            .collect();
        for cid in active {
            self.resolve_abandoned(&mut reg, &cid);
        }
    }
}
