//! Hand-off of captured frames from the presenting thread to the
//! background worker.
//!
//! The producer side is `FrameQueue::push`, which holds the lock only long
//! enough to append. The worker pops one frame per iteration and sleeps for
//! the configured idle interval when the queue is empty. Stopping the worker
//! discards whatever is still queued instead of draining it, so shutdown
//! latency is bounded by a single in-flight frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::CapturedFrame;
use crate::stats::PipelineStats;

/// FIFO of captured frames. When `capacity` is set and reached, the oldest
/// frame is evicted to make room.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<CapturedFrame>>,
    capacity: Option<usize>,
}

impl FrameQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.unwrap_or(4))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CapturedFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame without waiting for it to be consumed. Returns the
    /// evicted frame when the queue was full; it is dropped by the caller
    /// outside the lock.
    pub fn push(&self, frame: CapturedFrame) -> Option<CapturedFrame> {
        let mut frames = self.lock();
        let evicted = match self.capacity {
            Some(capacity) if frames.len() >= capacity => frames.pop_front(),
            _ => None,
        };
        frames.push_back(frame);
        evicted
    }

    pub fn pop(&self) -> Option<CapturedFrame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<CapturedFrame> = self.lock().drain(..).collect();
        drained.len()
    }
}

/// Worker-side handler for frames popped off the queue.
pub trait FrameConsumer: Send + 'static {
    fn process(&mut self, frame: CapturedFrame);

    /// Called on the worker thread once the loop exits.
    fn on_stop(&mut self) {}
}

/// Owns the single background thread that consumes the frame queue.
pub struct ProcessingWorker {
    queue: Arc<FrameQueue>,
    stats: Arc<PipelineStats>,
    idle_sleep: Duration,
    running: Arc<AtomicBool>,
    /// Cleared by the worker thread when it exits, including on panic.
    alive: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProcessingWorker {
    pub fn new(queue: Arc<FrameQueue>, stats: Arc<PipelineStats>, idle_sleep: Duration) -> Self {
        Self {
            queue,
            stats,
            idle_sleep,
            running: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            join_handle: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.alive.load(Ordering::Acquire)
    }

    /// Spawn the worker thread. Returns `Ok(false)` and drops `consumer`
    /// when a worker is already running.
    pub fn start<C: FrameConsumer>(&self, consumer: C) -> FrameGenResult<bool> {
        let mut handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Ok(false);
        }
        if let Some(finished) = handle.take() {
            if finished.join().is_err() {
                tracing::error!("previous frame worker exited with a panic");
            }
        }

        self.running.store(true, Ordering::Release);
        self.alive.store(true, Ordering::Release);

        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let alive = AliveGuard(Arc::clone(&self.alive));
        let idle_sleep = self.idle_sleep;

        let spawned = std::thread::Builder::new()
            .name("crosslink-frame-worker".to_string())
            .spawn(move || {
                let _alive = alive;
                worker_loop(&queue, &stats, &running, idle_sleep, consumer);
            });

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                tracing::info!("frame worker started");
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.alive.store(false, Ordering::Release);
                Err(FrameGenError::Platform(anyhow::anyhow!(
                    "failed to spawn frame worker thread: {e}"
                )))
            }
        }
    }

    /// Signal the worker, join it, and discard any frames still queued.
    /// Returns the number of discarded frames.
    pub fn stop(&self) -> usize {
        self.running.store(false, Ordering::Release);
        let join = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("frame worker exited with a panic");
            }
        }

        let discarded = self.queue.clear();
        if discarded > 0 {
            self.stats
                .frames_discarded_at_shutdown
                .fetch_add(discarded as u64, Ordering::Relaxed);
            tracing::info!(discarded, "frame worker stopped, queued frames dropped");
        }
        discarded
    }
}

impl Drop for ProcessingWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<C: FrameConsumer>(
    queue: &FrameQueue,
    stats: &PipelineStats,
    running: &AtomicBool,
    idle_sleep: Duration,
    mut consumer: C,
) {
    while running.load(Ordering::Acquire) {
        match queue.pop() {
            Some(frame) => {
                PipelineStats::bump(&stats.frames_processed);
                consumer.process(frame);
            }
            None => std::thread::sleep(idle_sleep),
        }
    }
    consumer.on_stop();
}
