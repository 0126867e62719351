use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Non-owning pointer to the application's command queue.
///
/// No reference is taken; the queue lives as long as the application keeps
/// its device alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueRef(NonNull<c_void>);

// The pointer is only ever dereferenced through the driver's own
// free-threaded queue interface.
unsafe impl Send for QueueRef {}
unsafe impl Sync for QueueRef {}

impl QueueRef {
    pub fn new(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Queue type reported by the submission queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
    Other,
}

type CaptureObserver = Box<dyn Fn(QueueRef) + Send + Sync>;

/// Write-once slot for the first direct queue seen submitting work.
pub struct CommandQueueCapture {
    slot: AtomicPtr<c_void>,
    observer: Option<CaptureObserver>,
}

impl Default for CommandQueueCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueueCapture {
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            observer: None,
        }
    }

    /// `observer` runs exactly once, on the thread that wins the capture.
    pub fn with_observer(observer: impl Fn(QueueRef) + Send + Sync + 'static) -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            observer: Some(Box::new(observer)),
        }
    }

    #[inline]
    pub fn is_captured(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }

    pub fn get(&self) -> Option<QueueRef> {
        QueueRef::new(self.slot.load(Ordering::Acquire))
    }

    /// Offer a queue seen on the submission path. `kind` is only evaluated
    /// while the slot is still empty, so the steady-state cost is one
    /// atomic load.
    ///
    /// Returns `true` for the single call that stored the queue.
    #[inline]
    pub fn offer(&self, queue: *mut c_void, kind: impl FnOnce() -> QueueKind) -> bool {
        if self.is_captured() {
            return false;
        }
        let Some(queue) = QueueRef::new(queue) else {
            return false;
        };
        if kind() != QueueKind::Direct {
            return false;
        }
        self.store_first(queue)
    }

    #[cold]
    fn store_first(&self, queue: QueueRef) -> bool {
        let won = self
            .slot
            .compare_exchange(
                ptr::null_mut(),
                queue.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            tracing::info!(queue = ?queue.as_raw(), "captured direct command queue");
            if let Some(observer) = &self.observer {
                observer(queue);
            }
        }
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn fake_queue(addr: usize) -> *mut c_void {
        addr as *mut c_void
    }

    #[test]
    fn only_direct_queues_are_captured() {
        let capture = CommandQueueCapture::new();
        assert!(!capture.offer(fake_queue(0x1000), || QueueKind::Compute));
        assert!(!capture.offer(fake_queue(0x2000), || QueueKind::Copy));
        assert!(!capture.offer(ptr::null_mut(), || QueueKind::Direct));
        assert!(capture.get().is_none());

        assert!(capture.offer(fake_queue(0x3000), || QueueKind::Direct));
        assert_eq!(capture.get().map(QueueRef::as_raw), Some(fake_queue(0x3000)));
    }

    #[test]
    fn later_offers_are_ignored_without_querying_kind() {
        let capture = CommandQueueCapture::new();
        assert!(capture.offer(fake_queue(0x10), || QueueKind::Direct));

        let queried = AtomicUsize::new(0);
        for addr in [0x20, 0x30, 0x40] {
            let stored = capture.offer(fake_queue(addr), || {
                queried.fetch_add(1, Ordering::Relaxed);
                QueueKind::Direct
            });
            assert!(!stored);
        }
        assert_eq!(queried.load(Ordering::Relaxed), 0);
        assert_eq!(capture.get().map(QueueRef::as_raw), Some(fake_queue(0x10)));
    }

    #[test]
    fn concurrent_offers_capture_exactly_one_queue() {
        const THREADS: usize = 8;
        let notified = Arc::new(AtomicUsize::new(0));
        let observer_count = Arc::clone(&notified);
        let capture = Arc::new(CommandQueueCapture::with_observer(move |_| {
            observer_count.fetch_add(1, Ordering::SeqCst);
        }));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let capture = Arc::clone(&capture);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut wins = 0usize;
                    for round in 0..100 {
                        let addr = 0x1000 * (i + 1) + round * 8;
                        if capture.offer(addr as *mut c_void, || QueueKind::Direct) {
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();

        let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_wins, 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(capture.is_captured());
    }
}
