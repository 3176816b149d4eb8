//! Fixed-size thread pool fed through a bounded queue.
//!
//! Every worker is built up front (so a failing database connection surfaces
//! before any unit is queued), then moved onto its own thread. A worker owns
//! its connection for its whole life; the connection closes when the thread
//! drops the worker, however the loop ended.

use crate::context::RunContext;
use crate::error::PipelineError;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

pub trait Worker: Send + 'static {
    type Item: Send + 'static;

    fn process(&mut self, item: Self::Item);

    /// Called once after the queue closed or the run stopped.
    fn finish(&mut self) {}
}

pub struct WorkerPool<I> {
    name: String,
    sender: Option<Sender<I>>,
    handles: Vec<JoinHandle<()>>,
}

impl<I: Send + 'static> WorkerPool<I> {
    pub fn spawn<W, F>(
        name: &str,
        size: usize,
        capacity: usize,
        ctx: &Arc<RunContext>,
        mut factory: F,
    ) -> Result<Self, PipelineError>
    where
        W: Worker<Item = I>,
        F: FnMut(usize) -> Result<W, PipelineError>,
    {
        let workers = (0..size.max(1))
            .map(&mut factory)
            .collect::<Result<Vec<W>, _>>()?;

        let (sender, receiver) = bounded(capacity.max(1));
        let mut handles = Vec::with_capacity(workers.len());
        for (index, worker) in workers.into_iter().enumerate() {
            let receiver = receiver.clone();
            let ctx = Arc::clone(ctx);
            let thread_name = format!("citypipe-{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(worker, &receiver, &ctx, &thread_name))
                .map_err(|e| PipelineError::Internal(format!("cannot spawn {name} worker: {e}")))?;
            handles.push(handle);
        }
        debug!(pool = name, workers = handles.len(), capacity, "Worker pool started");

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            handles,
        })
    }

    /// Queues one item, blocking while the queue is full.
    ///
    /// Fails once every worker has stopped.
    pub fn submit(&self, item: I) -> Result<(), PipelineError> {
        self.sender
            .as_ref()
            .ok_or_else(|| PipelineError::PoolClosed(self.name.clone()))?
            .send(item)
            .map_err(|_| PipelineError::PoolClosed(self.name.clone()))
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Closes the queue and waits for every worker to finish.
    pub fn join(mut self) -> Result<(), PipelineError> {
        drop(self.sender.take());
        let mut panicked = None;
        for handle in self.handles.drain(..) {
            let thread_name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                panicked = Some(thread_name);
            }
        }
        debug!(pool = %self.name, "Worker pool joined");
        match panicked {
            Some(thread_name) => Err(PipelineError::WorkerPanic(thread_name)),
            None => Ok(()),
        }
    }
}

impl<I> Drop for WorkerPool<I> {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker<W: Worker>(mut worker: W, receiver: &Receiver<W::Item>, ctx: &RunContext, name: &str) {
    for item in receiver.iter() {
        if !ctx.should_continue() {
            break;
        }
        // A panicking unit must not take the run down silently.
        if panic::catch_unwind(AssertUnwindSafe(|| worker.process(item))).is_err() {
            ctx.abort(&PipelineError::WorkerPanic(name.to_string()), None);
            break;
        }
    }
    if panic::catch_unwind(AssertUnwindSafe(|| worker.finish())).is_err() {
        ctx.abort(&PipelineError::WorkerPanic(name.to_string()), None);
    }
    debug!(worker = name, "Worker stopped");
}
