use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Single-picture mailbox between a background reader and its source.
///
/// The reader overwrites the slot with every new picture; readers of the slot
/// always see the most recent one. Nothing ever queues.
pub(crate) struct FrameSlot<T> {
    state: Arc<Mutex<SlotState<T>>>,
    shutdown: Arc<AtomicBool>,
}

struct SlotState<T> {
    latest: Option<T>,
    size: (u32, u32),
    frames: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl<T> Clone for FrameSlot<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Clone> FrameSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                latest: None,
                size: (0, 0),
                frames: 0,
                last_frame_at: None,
                last_error: None,
            })),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current picture.
    pub(crate) fn publish(&self, picture: T, width: u32, height: u32) {
        let mut state = self.lock();
        state.latest = Some(picture);
        state.size = (width, height);
        state.frames += 1;
        state.last_frame_at = Some(Instant::now());
        state.last_error = None;
    }

    pub(crate) fn fail(&self, error: String) {
        self.lock().last_error = Some(error);
    }

    pub(crate) fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    pub(crate) fn has_frame(&self) -> bool {
        self.lock().latest.is_some()
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        self.lock().size
    }

    pub(crate) fn frames(&self) -> u64 {
        self.lock().frames
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Time since the last published picture.
    pub(crate) fn idle_for(&self) -> Option<std::time::Duration> {
        self.lock().last_frame_at.map(|at| at.elapsed())
    }

    /// Ask the reader to stop and drop the buffered picture.
    pub(crate) fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut state = self.lock();
        state.latest = None;
        state.size = (0, 0);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
