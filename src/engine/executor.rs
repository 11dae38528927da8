//! Model executor boundary.
//!
//! The forward pass is an external collaborator: the core hands it a
//! [`SchedulerOutput`] batch descriptor and gets back per-request logits
//! (and optionally hidden states). Executors run on their own worker
//! thread behind a message-passing boundary; [`ExecutorHandle::wait`] is
//! the control loop's single executor suspension point and always carries
//! a deadline.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use candle_core::Tensor;

use crate::core::request::RequestId;
use crate::error::{Error, Result};
use crate::scheduler::SchedulerOutput;

/// Per-step result from the model executor.
///
/// `logits` holds one row per scheduled input token for each request,
/// shape `[num_inputs, vocab]`: row `i` is the next-token distribution
/// after consuming input `i`. `hidden_states` optionally carries final
/// per-request feature tensors for proposers that condition on them.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub logits: HashMap<RequestId, Tensor>,
    pub hidden_states: HashMap<RequestId, Tensor>,
}

/// The forward-pass collaborator.
///
/// Implementations may wrap a local model, a worker pool, or a remote
/// process; the core only sees this call.
pub trait ModelExecutor: Send {
    fn execute(&mut self, batch: &SchedulerOutput) -> Result<StepOutput>;
}

/// Owns an executor's worker thread and the channels to it.
///
/// `submit` enqueues a batch; `wait` blocks for its result with a
/// deadline. One batch is in flight at a time from the control loop's
/// perspective.
pub struct ExecutorHandle {
    submit_tx: Option<Sender<SchedulerOutput>>,
    result_rx: Receiver<Result<StepOutput>>,
    worker: Option<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Spawn a worker thread around the executor.
    pub fn spawn(mut executor: Box<dyn ModelExecutor>) -> Result<Self> {
        let (submit_tx, submit_rx) = mpsc::channel::<SchedulerOutput>();
        let (result_tx, result_rx) = mpsc::channel();

        let worker = std::thread::Builder::new()
            .name("model-executor".to_string())
            .spawn(move || {
                while let Ok(batch) = submit_rx.recv() {
                    let output = executor.execute(&batch);
                    if result_tx.send(output).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            submit_tx: Some(submit_tx),
            result_rx,
            worker: Some(worker),
        })
    }

    /// Enqueue a batch for execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorDisconnected`] if the worker is gone.
    pub fn submit(&self, batch: SchedulerOutput) -> Result<()> {
        self.submit_tx
            .as_ref()
            .ok_or(Error::ExecutorDisconnected)?
            .send(batch)
            .map_err(|_| Error::ExecutorDisconnected)
    }

    /// Block until the in-flight batch's result arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorTimeout`] when the deadline elapses and
    /// [`Error::ExecutorDisconnected`] when the worker died.
    pub fn wait(&self, deadline: Duration) -> Result<StepOutput> {
        match self.result_rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::ExecutorTimeout(deadline)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ExecutorDisconnected),
        }
    }

    /// Submit a batch and wait for its result.
    pub fn execute(&self, batch: SchedulerOutput, deadline: Duration) -> Result<StepOutput> {
        self.submit(batch)?;
        self.wait(deadline)
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        // Closing the submit channel ends the worker loop.
        self.submit_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
