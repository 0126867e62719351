use crate::backend::{ExportableTexture, SharedOsHandle};
use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::SurfaceDesc;

/// An exported texture: the OS handle plus what the importer needs to
/// interpret it. Closing happens when this is dropped.
pub struct SharedFrameHandle {
    handle: Box<dyn SharedOsHandle>,
    desc: SurfaceDesc,
}

impl SharedFrameHandle {
    pub fn raw(&self) -> usize {
        self.handle.raw()
    }

    pub fn desc(&self) -> SurfaceDesc {
        self.desc
    }
}

impl std::fmt::Debug for SharedFrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameHandle")
            .field("raw", &format_args!("{:#x}", self.handle.raw()))
            .field("desc", &self.desc)
            .finish()
    }
}

/// Exposes GPU-resident frames to the secondary device through OS-level
/// shared handles. Holds at most one live handle.
#[derive(Debug, Default)]
pub struct FrameTransferBridge {
    current: Option<SharedFrameHandle>,
}

impl FrameTransferBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&SharedFrameHandle> {
        self.current.as_ref()
    }

    /// Export `texture`. On success the previous handle is closed and the
    /// new one stored; on failure the previous handle is left in place.
    pub fn export(&mut self, texture: &dyn ExportableTexture) -> FrameGenResult<&SharedFrameHandle> {
        let shareable = texture
            .query_shareable()
            .map_err(|e| FrameGenError::QueryFailed(format!("{e:#}")))?;
        if !shareable {
            return Err(FrameGenError::NotShareable);
        }

        let handle = texture
            .create_shared_handle()
            .map_err(|e| FrameGenError::HandleCreationFailed(format!("{e:#}")))?;

        let exported = SharedFrameHandle {
            handle,
            desc: texture.desc(),
        };
        // Replacing drops, and thereby closes, the previous handle.
        Ok(self.current.insert(exported))
    }

    /// Close the stored handle, if any.
    pub fn release(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SurfaceFormat;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    /// Tracks how many handles are open at once.
    #[derive(Default)]
    struct HandleCounter {
        live: AtomicI64,
        created: AtomicUsize,
    }

    struct MockHandle {
        raw: usize,
        counter: Arc<HandleCounter>,
    }

    impl SharedOsHandle for MockHandle {
        fn raw(&self) -> usize {
            self.raw
        }
    }

    impl Drop for MockHandle {
        fn drop(&mut self) {
            self.counter.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct MockTexture {
        shareable: bool,
        query_fails: bool,
        create_fails: bool,
        counter: Arc<HandleCounter>,
    }

    impl MockTexture {
        fn shareable(counter: &Arc<HandleCounter>) -> Self {
            Self {
                shareable: true,
                query_fails: false,
                create_fails: false,
                counter: Arc::clone(counter),
            }
        }
    }

    impl ExportableTexture for MockTexture {
        fn desc(&self) -> SurfaceDesc {
            SurfaceDesc {
                width: 64,
                height: 32,
                format: SurfaceFormat::Bgra8,
            }
        }

        fn query_shareable(&self) -> anyhow::Result<bool> {
            if self.query_fails {
                anyhow::bail!("GetHeapProperties failed");
            }
            Ok(self.shareable)
        }

        fn create_shared_handle(&self) -> anyhow::Result<Box<dyn SharedOsHandle>> {
            if self.create_fails {
                anyhow::bail!("CreateSharedHandle failed");
            }
            let id = self.counter.created.fetch_add(1, Ordering::SeqCst);
            self.counter.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockHandle {
                raw: 0x100 + id,
                counter: Arc::clone(&self.counter),
            }))
        }
    }

    #[test]
    fn repeated_exports_keep_one_live_handle() -> FrameGenResult<()> {
        let counter = Arc::new(HandleCounter::default());
        let texture = MockTexture::shareable(&counter);
        let mut bridge = FrameTransferBridge::new();

        for _ in 0..10 {
            bridge.export(&texture)?;
            assert_eq!(counter.live.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.created.load(Ordering::SeqCst), 10);
        assert_eq!(bridge.current().map(SharedFrameHandle::raw), Some(0x100 + 9));

        bridge.release();
        assert_eq!(counter.live.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn unshareable_texture_leaves_previous_handle_untouched() -> FrameGenResult<()> {
        let counter = Arc::new(HandleCounter::default());
        let mut bridge = FrameTransferBridge::new();
        let previous = bridge.export(&MockTexture::shareable(&counter))?.raw();

        let plain = MockTexture {
            shareable: false,
            ..MockTexture::shareable(&counter)
        };
        assert!(matches!(bridge.export(&plain), Err(FrameGenError::NotShareable)));
        assert_eq!(bridge.current().map(SharedFrameHandle::raw), Some(previous));
        assert_eq!(counter.live.load(Ordering::SeqCst), 1);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn query_and_creation_failures_store_nothing() {
        let counter = Arc::new(HandleCounter::default());
        let mut bridge = FrameTransferBridge::new();

        let broken_query = MockTexture {
            query_fails: true,
            ..MockTexture::shareable(&counter)
        };
        assert!(matches!(
            bridge.export(&broken_query),
            Err(FrameGenError::QueryFailed(_))
        ));

        let broken_create = MockTexture {
            create_fails: true,
            ..MockTexture::shareable(&counter)
        };
        assert!(matches!(
            bridge.export(&broken_create),
            Err(FrameGenError::HandleCreationFailed(_))
        ));
        assert!(bridge.current().is_none());
        assert_eq!(counter.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exported_handle_carries_texture_metadata() -> FrameGenResult<()> {
        let counter = Arc::new(HandleCounter::default());
        let mut bridge = FrameTransferBridge::new();
        let handle = bridge.export(&MockTexture::shareable(&counter))?;
        assert_eq!(handle.desc().width, 64);
        assert_eq!(handle.desc().format, SurfaceFormat::Bgra8);
        Ok(())
    }
}
