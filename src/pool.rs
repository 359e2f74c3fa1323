//! Fixed-size worker pool with bounded queues.
//!
//! Jobs carry owned block payloads and a sequence number; workers run a
//! caller-supplied function and push results back in completion order. The
//! job queue is bounded, so `submit` blocks when all workers are busy and
//! the queue is full, so memory stays capped at roughly
//! `queue_capacity * block_size` instead of buffering the whole input.
//!
//! Reordering results back into sequence order is the pipeline's business,
//! not the pool's: `collect` hands results back as workers finish them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::error::{PargzError, PargzResult};

/// One unit of work: a block of bytes tagged with its stream position.
#[derive(Debug)]
pub struct Job {
    /// Gapless, strictly increasing position within the stream.
    pub seq: u64,
    /// Owned block bytes (raw on compression, compressed on decompression).
    pub payload: Vec<u8>,
    /// Whether this is the final block of the stream.
    pub is_last: bool,
}

/// Outcome of one job, matched to it by `seq`.
#[derive(Debug)]
pub struct WorkerResult {
    pub seq: u64,
    pub output: Vec<u8>,
    /// CRC32 of the uncompressed bytes of this block.
    pub crc32: u32,
    /// Uncompressed length of this block.
    pub raw_len: u64,
    /// Set when the job failed; siblings keep running, the pipeline decides
    /// whether the stream aborts.
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn failed(seq: u64, msg: impl Into<String>) -> Self {
        Self {
            seq,
            output: Vec::new(),
            crc32: 0,
            raw_len: 0,
            error: Some(msg.into()),
        }
    }
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<WorkerResult>,
    handles: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers running `worker_fn`. `queue_capacity` bounds
    /// the number of submitted-but-unclaimed jobs.
    pub fn new<F>(threads: usize, queue_capacity: usize, worker_fn: F) -> Self
    where
        F: Fn(Job) -> WorkerResult + Send + Sync + 'static,
    {
        let threads = threads.max(1);
        let (job_tx, job_rx) = bounded::<Job>(queue_capacity.max(1));
        // Result capacity covers the jobs that can be queued or running at
        // once, so workers only block on send when the caller over-submits
        // without collecting; callers drain results between submissions.
        let (result_tx, result_rx) = bounded::<WorkerResult>(queue_capacity.max(1) + threads);
        let worker_fn = Arc::new(worker_fn);

        let handles = (0..threads)
            .map(|_| {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let work = Arc::clone(&worker_fn);
                thread::spawn(move || {
                    for job in jobs.iter() {
                        if results.send(work(job)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            results: result_rx,
            handles,
            in_flight: 0,
        }
    }

    /// Submit a job. Blocks while the job queue is full.
    pub fn submit(&mut self, job: Job) -> PargzResult<()> {
        let seq = job.seq;
        let sender = self
            .jobs
            .as_ref()
            .ok_or_else(|| PargzError::resource("worker pool already shut down"))?;
        sender
            .send(job)
            .map_err(|_| PargzError::worker(seq, "worker pool disconnected"))?;
        self.in_flight += 1;
        Ok(())
    }

    /// Blocking: next result in completion order, NOT submission order.
    pub fn collect(&mut self) -> PargzResult<WorkerResult> {
        if self.in_flight == 0 {
            return Err(PargzError::resource("collect with no jobs in flight"));
        }
        let result = self
            .results
            .recv()
            .map_err(|_| PargzError::resource("worker pool disconnected"))?;
        self.in_flight -= 1;
        Ok(result)
    }

    /// Non-blocking variant of [`collect`](Self::collect).
    pub fn try_collect(&mut self) -> PargzResult<Option<WorkerResult>> {
        if self.in_flight == 0 {
            return Ok(None);
        }
        match self.results.try_recv() {
            Ok(result) => {
                self.in_flight -= 1;
                Ok(Some(result))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(PargzError::resource("worker pool disconnected"))
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stop accepting jobs, drain in-flight work, and join the workers.
    /// Remaining results are discarded; call `collect` first if they matter.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        // Closing the job channel lets the worker loops run dry and exit.
        self.jobs.take();
        while self.in_flight > 0 {
            match self.results.recv() {
                Ok(_) => self.in_flight -= 1,
                Err(_) => break,
            }
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
