//! Fixed-size pool of isolated execution slots.
//!
//! Each slot is a tokio task fed by its own channel and runs one job at a
//! time. Restarting a slot aborts its task and starts a fresh one; whatever
//! was bound to the old task is discarded and its handle reports
//! [`ToolError::Discarded`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PoolError, ToolError};
use crate::tools::ToolResponse;

/// Work submitted to a slot.
pub type Job = BoxFuture<'static, ToolResponse>;

/// What a slot hands back for a job.
pub type JobOutcome = Result<ToolResponse, ToolError>;

/// Observable state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    /// The slot's task is gone; the next submit restarts it.
    Broken,
}

struct Assignment {
    job: Job,
    reply: oneshot::Sender<JobOutcome>,
}

struct Slot {
    tx: mpsc::UnboundedSender<Assignment>,
    runner: JoinHandle<()>,
    busy: Arc<AtomicBool>,
    generation: u64,
}

impl Slot {
    fn spawn(index: usize, generation: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let runner = tokio::spawn(run_slot(index, rx, Arc::clone(&busy)));
        Self {
            tx,
            runner,
            busy,
            generation,
        }
    }
}

async fn run_slot(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Assignment>,
    busy: Arc<AtomicBool>,
) {
    while let Some(Assignment { job, mut reply }) = rx.recv().await {
        busy.store(true, Ordering::SeqCst);
        let outcome = tokio::select! {
            result = AssertUnwindSafe(job).catch_unwind() => Some(result.map_err(|payload| {
                let reason = panic_message(payload.as_ref());
                warn!(slot = index, "Tool panicked: {reason}");
                ToolError::Panicked { reason }
            })),
            _ = reply.closed() => None,
        };
        busy.store(false, Ordering::SeqCst);

        match outcome {
            Some(outcome) => {
                let _ = reply.send(outcome);
            }
            None => debug!(slot = index, "Job cancelled by its handle"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle to a job bound to a slot.
#[derive(Debug)]
pub struct TaskHandle {
    slot: usize,
    rx: oneshot::Receiver<JobOutcome>,
}

impl TaskHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Non-blocking completion check. A job whose slot was torn down
    /// completes with [`ToolError::Discarded`].
    pub fn poll_done(&mut self) -> Option<JobOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(ToolError::Discarded { slot: self.slot }))
            }
        }
    }

    /// Ask the slot to stop working on this job.
    pub fn cancel(&mut self) {
        self.rx.close();
    }
}

/// A fixed number of execution slots.
pub struct WorkerPool {
    slots: Vec<Slot>,
}

impl WorkerPool {
    /// Start `size` slots. Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let slots = (0..size).map(|index| Slot::spawn(index, 0)).collect();
        info!(slots = size, "Worker pool started");
        Self { slots }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Bind `job` to slot `index`. A broken slot is restarted and the
    /// submit retried once.
    pub fn submit(&mut self, index: usize, job: Job) -> Result<TaskHandle, PoolError> {
        if self.state(index)? == SlotState::Broken {
            warn!(slot = index, "Worker slot is broken, restarting before submit");
            self.restart(index)?;
        }

        let (reply, rx) = oneshot::channel();
        let assignment = Assignment { job, reply };
        let assignment = match self.slots[index].tx.send(assignment) {
            Ok(()) => return Ok(TaskHandle { slot: index, rx }),
            Err(mpsc::error::SendError(assignment)) => assignment,
        };

        warn!(slot = index, "Worker slot rejected a job, restarting and retrying");
        self.restart(index)?;
        self.slots[index]
            .tx
            .send(assignment)
            .map_err(|_| PoolError::Broken { slot: index })?;
        Ok(TaskHandle { slot: index, rx })
    }

    /// Tear down slot `index` and start a fresh one in its place.
    pub fn restart(&mut self, index: usize) -> Result<(), PoolError> {
        let slot = self.slot(index)?;
        slot.runner.abort();
        let generation = slot.generation + 1;
        self.slots[index] = Slot::spawn(index, generation);
        info!(slot = index, generation, "Worker slot restarted");
        Ok(())
    }

    /// Stop slot `index` without replacing it.
    pub fn abort(&mut self, index: usize) -> Result<(), PoolError> {
        self.slot(index)?.runner.abort();
        Ok(())
    }

    pub fn state(&self, index: usize) -> Result<SlotState, PoolError> {
        let slot = self.slot(index)?;
        Ok(if slot.runner.is_finished() || slot.tx.is_closed() {
            SlotState::Broken
        } else if slot.busy.load(Ordering::SeqCst) {
            SlotState::Busy
        } else {
            SlotState::Idle
        })
    }

    /// How many times slot `index` has been restarted.
    pub fn generation(&self, index: usize) -> Result<u64, PoolError> {
        Ok(self.slot(index)?.generation)
    }

    fn slot(&self, index: usize) -> Result<&Slot, PoolError> {
        self.slots.get(index).ok_or(PoolError::SlotOutOfRange {
            slot: index,
            slots: self.slots.len(),
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.runner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::keychain::KeyChain;

    fn reply(message: &str) -> Job {
        let message = message.to_string();
        async move { ToolResponse::failure(message, KeyChain::default()) }.boxed()
    }

    fn sleepy(duration: Duration) -> Job {
        async move {
            tokio::time::sleep(duration).await;
            ToolResponse::failure("slept", KeyChain::default())
        }
        .boxed()
    }

    async fn explode() -> ToolResponse {
        panic!("tool exploded")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn runs_a_job() {
        let mut pool = WorkerPool::new(2);
        let mut handle = pool.submit(1, reply("done")).unwrap();
        assert_eq!(handle.slot(), 1);
        settle().await;

        let response = handle.poll_done().unwrap().unwrap();
        assert_eq!(response.message, "done");
        assert_eq!(pool.state(1).unwrap(), SlotState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_become_failures() {
        let mut pool = WorkerPool::new(1);
        let mut handle = pool.submit(0, explode().boxed()).unwrap();
        settle().await;

        let err = handle.poll_done().unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Panicked { ref reason } if reason == "tool exploded"));

        // The slot survives the panic.
        let mut handle = pool.submit(0, reply("after")).unwrap();
        settle().await;
        assert_eq!(handle.poll_done().unwrap().unwrap().message, "after");
        assert_eq!(pool.generation(0).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_discards_bound_job() {
        let mut pool = WorkerPool::new(1);
        let mut handle = pool.submit(0, sleepy(Duration::from_secs(60))).unwrap();
        settle().await;
        assert!(handle.poll_done().is_none());
        assert_eq!(pool.state(0).unwrap(), SlotState::Busy);

        pool.restart(0).unwrap();
        settle().await;
        assert!(matches!(
            handle.poll_done(),
            Some(Err(ToolError::Discarded { slot: 0 }))
        ));
        assert_eq!(pool.generation(0).unwrap(), 1);
        assert_eq!(pool.state(0).unwrap(), SlotState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_slot_restarts_on_submit() {
        let mut pool = WorkerPool::new(1);
        pool.abort(0).unwrap();
        settle().await;
        assert_eq!(pool.state(0).unwrap(), SlotState::Broken);

        let mut handle = pool.submit(0, reply("recovered")).unwrap();
        settle().await;
        assert_eq!(handle.poll_done().unwrap().unwrap().message, "recovered");
        assert_eq!(pool.generation(0).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_frees_the_slot() {
        let mut pool = WorkerPool::new(1);
        let mut handle = pool.submit(0, sleepy(Duration::from_secs(60))).unwrap();
        settle().await;
        handle.cancel();
        settle().await;
        assert_eq!(pool.state(0).unwrap(), SlotState::Idle);
    }

    #[tokio::test]
    async fn out_of_range() {
        let mut pool = WorkerPool::new(1);
        assert!(matches!(
            pool.submit(3, reply("x")),
            Err(PoolError::SlotOutOfRange { slot: 3, slots: 1 })
        ));
    }
}
