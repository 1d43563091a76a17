//! Bounded worker pool for oracle calls.
//!
//! Oracle calls dominate the latency of both the resolver and the dry-run
//! scan. The pool runs them on a fixed set of named threads fed by a bounded
//! channel. Batch submission fails fast with `QueueFull` so the scan can
//! drain its window. A single classify-one call waits for queue space instead,
//! bounded by the configured timeout like every reply wait. A timed-out call
//! is reported as `OracleError::Timeout`, never as an empty answer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde_json::Value;
use tracing::warn;

use crate::error::{ExecutionError, NormError, NormResult, OracleError};
use crate::oracle::{ClassifyManyRequest, ClassifyOneRequest, SemanticOracle};

type Reply = Sender<Result<Value, OracleError>>;

enum Job {
    ClassifyOne {
        request: ClassifyOneRequest,
        reply: Reply,
    },
    ClassifyMany {
        request: ClassifyManyRequest,
        reply: Reply,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Reply,
    },
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn run_guarded(call: impl FnOnce() -> Result<Value, OracleError>) -> Result<Value, OracleError> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|_| Err(OracleError::transport("oracle call panicked")))
}

/// Pending oracle call.
#[derive(Debug)]
pub struct OracleHandle {
    rx: Receiver<Result<Value, OracleError>>,
    timeout: Duration,
}

impl OracleHandle {
    /// Waits for the answer, up to the pool's timeout.
    ///
    /// # Errors
    /// - `Oracle(Timeout)` if no answer arrived in time
    /// - `Oracle(..)` if the oracle itself failed
    /// - `Execution(Disconnected)` if the worker went away
    pub fn wait(self) -> NormResult<Value> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(NormError::from),
            Err(RecvTimeoutError::Timeout) => Err(OracleError::Timeout {
                duration_ms: duration_ms(self.timeout),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::Disconnected.into()),
        }
    }
}

/// Fixed-size thread pool running calls against one oracle.
pub struct OraclePool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
    timeout: Duration,
}

impl OraclePool {
    /// Starts `workers` threads sharing a queue of `queue_capacity` jobs.
    /// Zero values are raised to one.
    ///
    /// # Errors
    /// Returns `Internal` if a worker thread cannot be spawned.
    pub fn start(
        oracle: Arc<dyn SemanticOracle>,
        workers: usize,
        queue_capacity: usize,
        timeout: Duration,
    ) -> NormResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let oracle = Arc::clone(&oracle);
            let handle = thread::Builder::new()
                .name(format!("kyronorm-oracle-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job {
                            Job::ClassifyOne { request, reply } => {
                                let _ = reply.send(run_guarded(|| oracle.classify_one(&request)));
                            }
                            Job::ClassifyMany { request, reply } => {
                                let _ = reply.send(run_guarded(|| oracle.classify_many(&request)));
                            }
                            #[cfg(test)]
                            Job::Sleep { duration, reply } => {
                                thread::sleep(duration);
                                let _ = reply.send(Ok(Value::Null));
                            }
                        }
                    }
                })
                .map_err(|e| NormError::internal(format!("failed to spawn oracle worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
            queue_capacity,
            timeout,
        })
    }

    /// Queue capacity after clamping.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn try_submit(&self, job: Job, rx: Receiver<Result<Value, OracleError>>) -> NormResult<OracleHandle> {
        let tx = self.tx.as_ref().ok_or(ExecutionError::Disconnected)?;
        match tx.try_send(job) {
            Ok(()) => Ok(OracleHandle {
                rx,
                timeout: self.timeout,
            }),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected.into()),
        }
    }

    fn send_within_timeout(&self, job: Job, rx: Receiver<Result<Value, OracleError>>) -> NormResult<OracleHandle> {
        let tx = self.tx.as_ref().ok_or(ExecutionError::Disconnected)?;
        match tx.send_timeout(job, self.timeout) {
            Ok(()) => Ok(OracleHandle {
                rx,
                timeout: self.timeout,
            }),
            Err(SendTimeoutError::Timeout(_)) => Err(OracleError::Timeout {
                duration_ms: duration_ms(self.timeout),
            }
            .into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(ExecutionError::Disconnected.into()),
        }
    }

    /// Queues a classify-one call.
    ///
    /// # Errors
    /// `QueueFull` or `Disconnected`.
    pub fn submit_one(&self, request: ClassifyOneRequest) -> NormResult<OracleHandle> {
        let (reply, rx) = bounded(1);
        self.try_submit(Job::ClassifyOne { request, reply }, rx)
    }

    /// Queues a classify-many call.
    ///
    /// # Errors
    /// `QueueFull` or `Disconnected`.
    pub fn submit_many(&self, request: ClassifyManyRequest) -> NormResult<OracleHandle> {
        let (reply, rx) = bounded(1);
        self.try_submit(Job::ClassifyMany { request, reply }, rx)
    }

    /// Runs a classify-one call and waits for it.
    ///
    /// A full queue is waited out for up to the pool timeout; the reply wait
    /// then gets its own timeout.
    ///
    /// # Errors
    /// - `Oracle(Timeout)` if no queue space frees up in time
    /// - `Disconnected` if the pool is shut down
    /// - anything [`OracleHandle::wait`] returns
    pub fn classify_one(&self, request: ClassifyOneRequest) -> NormResult<Value> {
        let (reply, rx) = bounded(1);
        self.send_within_timeout(Job::ClassifyOne { request, reply }, rx)?.wait()
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> NormResult<OracleHandle> {
        let (reply, rx) = bounded(1);
        self.try_submit(Job::Sleep { duration, reply }, rx)
    }
}

impl Drop for OraclePool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued jobs and exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("oracle worker exited by panic");
            }
        }
    }
}
