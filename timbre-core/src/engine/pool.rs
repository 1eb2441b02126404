//! Dispatcher loop and bounded worker pool.
//!
//! ```text
//! queue ──► dispatcher (one thread, FIFO)
//!             └─► wait for semaphore permit
//!                   └─► spawn_blocking(worker.run(job)) ── permit released on exit
//! ```
//!
//! The dispatcher never runs job code itself, so a failing or panicking job
//! only ever takes down its own worker task.
//!
//! Each `start()` bumps a generation counter; a dispatcher whose generation
//! is no longer current exits even if the engine was restarted meanwhile.
//! The held slot is locked for a dispatcher's whole life, so the next one
//! starts only after the previous one has left. A job taken off the queue
//! but never admitted is parked in that slot and dispatched first next time.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use super::{pipeline::Worker, QueuedJob};

/// How long a blocked dispatcher waits before re-checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct DispatchContext {
    pub queue: Receiver<QueuedJob>,
    /// Job dequeued by a stopped dispatcher, owed to the next one.
    pub held: Arc<Mutex<Option<QueuedJob>>>,
    pub running: Arc<AtomicBool>,
    /// Latest generation handed out by `start()`.
    pub current: Arc<AtomicU64>,
    /// This dispatcher's generation.
    pub generation: u64,
    pub permits: Arc<Semaphore>,
    pub runtime: tokio::runtime::Handle,
    pub worker: Arc<Worker>,
}

impl DispatchContext {
    fn active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Run the dispatcher until the engine stops or a newer dispatcher starts.
pub(crate) fn run(ctx: DispatchContext) {
    let mut held = ctx.held.lock();
    info!(generation = ctx.generation, "dispatcher started");

    loop {
        // ── 0. Check running flag and generation ──────────────────────────
        if !ctx.active() {
            break;
        }

        // ── 1. Next job, FIFO: a parked job goes before the queue ─────────
        let queued = match held.take() {
            Some(q) => q,
            None => match ctx.queue.recv_timeout(POLL_INTERVAL) {
                Ok(q) => q,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        // ── 2. Admission: one permit per running job ──────────────────────
        let Some(permit) = acquire(&ctx) else {
            debug!(job_id = %queued.job.id, "dispatcher stopping, job parked");
            *held = Some(queued);
            break;
        };

        // ── 3. Hand off to the blocking pool ──────────────────────────────
        let worker = Arc::clone(&ctx.worker);
        ctx.runtime.spawn_blocking(move || {
            let _permit = permit;
            let job_id = queued.job.id.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| worker.run(&queued.job, &queued.cancel)));
            if let Err(panic) = outcome {
                let msg = panic_message(&panic);
                error!(job_id = %job_id, panic = %msg, "job worker panicked");
                worker.fail_after_panic(&queued.job, &msg);
            }
        });
    }

    info!(generation = ctx.generation, "dispatcher stopped");
}

/// Wait for a pool permit, giving up if the engine stops meanwhile.
fn acquire(ctx: &DispatchContext) -> Option<OwnedSemaphorePermit> {
    loop {
        if let Ok(permit) = Arc::clone(&ctx.permits).try_acquire_owned() {
            return Some(permit);
        }
        if !ctx.active() {
            return None;
        }
        let waited = ctx.runtime.block_on(tokio::time::timeout(
            POLL_INTERVAL,
            Arc::clone(&ctx.permits).acquire_owned(),
        ));
        match waited {
            Ok(Ok(permit)) => return Some(permit),
            // Closed semaphore: nothing will ever be admitted again.
            Ok(Err(_)) => return None,
            Err(_elapsed) => continue,
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
