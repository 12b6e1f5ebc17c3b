use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    ipfs::IpfsClient,
    optracker::{Operation, OperationTracker, OperationType},
};

/// Bounded pool running queued operations against the daemon.
///
/// At most `slots` operations hold a permit at any time. An operation starts
/// right away when the queue is empty and a permit is free; otherwise it waits
/// in the queue, which workers drain before giving their permit back.
pub struct Scheduler<C: IpfsClient + 'static> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    ipfs: Arc<C>,
    optracker: Arc<OperationTracker>,
    slots: Arc<Semaphore>,
    size: usize,
    queue: Mutex<VecDeque<Operation>>,
    tasks: TaskTracker,
    closed: CancellationToken,
    handle: Handle,
}

impl<C: IpfsClient + 'static> Scheduler<C> {
    pub fn new(
        ipfs: Arc<C>,
        optracker: Arc<OperationTracker>,
        slots: usize,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ipfs,
                optracker,
                slots: Arc::new(Semaphore::new(slots)),
                size: slots,
                queue: Mutex::new(VecDeque::new()),
                tasks: TaskTracker::new(),
                closed: CancellationToken::new(),
                handle,
            }),
        }
    }

    /// Queues `op` for execution. `priority` puts it ahead of everything else
    /// waiting. Returns false once the scheduler is shut down, after resolving
    /// the operation's record.
    pub fn submit(&self, op: Operation, priority: bool) -> bool {
        let inner = &self.inner;
        let mut queue = inner.lock_queue();
        // checked under the queue lock so that shutdown's drain cannot miss it
        if inner.closed.is_cancelled() {
            drop(queue);
            tracing::debug!(cid = %op.cid(), op = %op.op_type(), "operation_refused");
            inner.optracker.abandon(&op);
            return false;
        }

        if queue.is_empty() {
            // Try get a permit without waiting
            if let Ok(permit) = inner.slots.clone().try_acquire_owned() {
                drop(queue);
                let worker = Inner::worker(inner.clone(), op, permit);
                inner.tasks.spawn_on(worker, &inner.handle);
                return true;
            }
        }

        tracing::debug!(cid = %op.cid(), op = %op.op_type(), priority, "operation_queued");
        if priority {
            queue.push_front(op);
        } else {
            queue.push_back(op);
        }
        true
    }

    /// Operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.inner.size - self.inner.slots.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Stops admitting work, cancels everything outstanding and waits for the
    /// workers to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let drained: Vec<Operation> = {
            let mut queue = inner.lock_queue();
            if !inner.closed.is_cancelled() {
                tracing::info!("scheduler_shutdown");
            }
            inner.closed.cancel();
            queue.drain(..).collect()
        };
        for op in drained {
            op.token().cancel();
            op.exited().cancel();
        }
        inner.optracker.cancel_all();

        inner.tasks.close();
        inner.tasks.wait().await;
    }
}

impl<C: IpfsClient + 'static> Inner<C> {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Operation>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn worker(self: Arc<Self>, mut op: Operation, permit: OwnedSemaphorePermit) {
        loop {
            self.execute(op).await;

            // The permit is released under the queue lock so that a
            // concurrent submit either sees the queued item taken or finds
            // the permit free.
            op = {
                let mut queue = self.lock_queue();
                match queue.pop_front() {
                    Some(next) => next,
                    None => {
                        drop(permit);
                        return;
                    }
                }
            };
        }
    }

    async fn execute(&self, op: Operation) {
        let _exited = op.exited().clone().drop_guard();
        let token = op.token().clone();
        let cid = op.cid().clone();

        if token.is_cancelled() {
            tracing::debug!(%cid, op = %op.op_type(), "operation_skipped");
            return;
        }

        for after in op.after() {
            tokio::select! {
                _ = after.cancelled() => {}
                _ = token.cancelled() => return,
            }
        }

        if !self.optracker.start(&op) {
            return;
        }
        tracing::info!(%cid, op = %op.op_type(), "operation_started");

        let res = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(%cid, op = %op.op_type(), "operation_cancelled");
                return;
            }
            res = async {
                match op.op_type() {
                    OperationType::Pin => self.ipfs.pin_add(&cid).await,
                    OperationType::Unpin => self.ipfs.pin_rm(&cid).await,
                }
            } => res,
        };

        match res {
            Ok(()) => {
                tracing::info!(%cid, op = %op.op_type(), "operation_done");
                self.optracker.finish(&op, Ok(()));
            }
            Err(e) => {
                tracing::error!(%cid, op = %op.op_type(), error = ?e, "operation_failed");
                self.optracker.finish(&op, Err(format!("{e:#}")));
            }
        }
    }
}
