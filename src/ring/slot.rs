//! One ring buffer entry
//!
//! A slot carries two independent locks. The image lock guards pixel memory
//! and the GPU handles attached to it; the state lock guards the small
//! status record. The image lock may be held while taking the state lock,
//! never the other way round. The state lock is only ever taken by short
//! bounded attempts that are retried, so a thread holding an image lock never
//! parks indefinitely on another thread's state lock.

use crate::gpu::{FramebufferRef, MappedBuffer, PixelBuffer, ScopedFence};
use crate::types::FrameStamp;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLOW_LOCK: Duration = Duration::from_millis(1);
/// One bounded attempt at the state lock
const STATE_ATTEMPT: Duration = Duration::from_micros(200);

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Free for the render thread
    NotReady,
    /// Readback issued
    Reading,
    /// Pixels reachable from host memory
    Mapped,
    /// Pixels being packed into the host buffer
    Transferring,
    /// Host buffer complete, GPU mapping still held
    NeedsUnmap,
    /// Complete frame waiting for the output
    Ready,
}

impl SlotState {
    /// The single legal successor of each state
    pub fn next(self) -> SlotState {
        match self {
            SlotState::NotReady => SlotState::Reading,
            SlotState::Reading => SlotState::Mapped,
            SlotState::Mapped => SlotState::Transferring,
            SlotState::Transferring => SlotState::NeedsUnmap,
            SlotState::NeedsUnmap => SlotState::Ready,
            SlotState::Ready => SlotState::NotReady,
        }
    }

    pub fn can_advance_to(self, to: SlotState) -> bool {
        self.next() == to
    }

    pub fn name(self) -> &'static str {
        match self {
            SlotState::NotReady => "NotReady",
            SlotState::Reading => "Reading",
            SlotState::Mapped => "Mapped",
            SlotState::Transferring => "Transferring",
            SlotState::NeedsUnmap => "NeedsUnmap",
            SlotState::Ready => "Ready",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel memory and GPU handles of a slot, guarded by the image lock
#[derive(Debug)]
pub struct SlotImage {
    /// Host buffer of exactly the channel's buffer size
    pub data: Arc<Vec<u8>>,
    /// Padded synchronous readback target; empty when unused
    pub staging: Vec<u8>,
    pub pbo: Option<PixelBuffer>,
    /// Completion fence of the readback in flight
    pub fence: Option<ScopedFence>,
    /// GPU mapping, held only between `Mapped` and `NeedsUnmap`
    pub mapped: Option<MappedBuffer>,
}

/// Status record of a slot, guarded by the state lock
#[derive(Debug)]
pub struct SlotStatus {
    state: SlotState,
    pub fbo: Option<FramebufferRef>,
    pub stamp: FrameStamp,
    /// Held by the output until its completion arrives
    pub locked: bool,
    /// Transfer failed; the output repeats the previous frame instead
    pub failed: bool,
    /// Host buffer published to the output once `Ready`
    pub output: Option<Arc<Vec<u8>>>,
}

impl SlotStatus {
    fn new() -> Self {
        Self {
            state: SlotState::NotReady,
            fbo: None,
            stamp: FrameStamp::default(),
            locked: false,
            failed: false,
            output: None,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Move to `to` if that is the legal next state
    ///
    /// Illegal transitions assert in debug builds and are logged and ignored
    /// in release builds.
    pub fn transition(&mut self, to: SlotState, thread: &str) -> bool {
        if self.state.can_advance_to(to) {
            self.state = to;
            return true;
        }
        tracing::warn!(
            "{}: illegal slot transition {} -> {} (frame {})",
            thread,
            self.state,
            to,
            self.stamp.sequence
        );
        debug_assert!(false, "illegal slot transition {} -> {}", self.state, to);
        false
    }

    /// Force `NotReady`; only used when a channel is torn down
    pub fn reset(&mut self) {
        self.state = SlotState::NotReady;
        self.fbo = None;
        self.locked = false;
        self.failed = false;
        self.output = None;
    }
}

/// A ring buffer entry of one channel
pub struct FrameSlot {
    index: usize,
    verbose: bool,
    image: Mutex<SlotImage>,
    status: Mutex<SlotStatus>,
}

impl FrameSlot {
    pub fn new(index: usize, buffer_size: usize, staging_size: usize, verbose: bool) -> Self {
        Self {
            index,
            verbose,
            image: Mutex::new(SlotImage {
                data: Arc::new(vec![0; buffer_size]),
                staging: vec![0; staging_size],
                pbo: None,
                fence: None,
                mapped: None,
            }),
            status: Mutex::new(SlotStatus::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock_image(&self, thread: &str) -> MutexGuard<'_, SlotImage> {
        self.timed(&self.image, thread, "image")
    }

    /// Take the state lock by repeated bounded attempts
    pub fn lock_state(&self, thread: &str) -> MutexGuard<'_, SlotStatus> {
        if let Some(guard) = self.status.try_lock() {
            return guard;
        }
        let start = Instant::now();
        let mut attempts = 1u32;
        let guard = loop {
            if let Some(guard) = self.status.try_lock_for(STATE_ATTEMPT) {
                break guard;
            }
            attempts += 1;
            std::thread::yield_now();
        };
        let waited = start.elapsed();
        if self.verbose && waited > SLOW_LOCK {
            tracing::debug!(
                "{}: waited {:.2} ms for state lock of slot {} ({} attempts)",
                thread,
                waited.as_secs_f64() * 1000.0,
                self.index,
                attempts
            );
        }
        guard
    }

    pub fn try_lock_state(&self) -> Option<MutexGuard<'_, SlotStatus>> {
        self.status.try_lock()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SlotState {
        self.status.lock().state
    }

    fn timed<'a, T>(&self, lock: &'a Mutex<T>, thread: &str, what: &str) -> MutexGuard<'a, T> {
        if !self.verbose {
            return lock.lock();
        }
        if let Some(guard) = lock.try_lock() {
            return guard;
        }
        let start = Instant::now();
        let guard = lock.lock();
        let waited = start.elapsed();
        if waited > SLOW_LOCK {
            tracing::debug!(
                "{}: waited {:.2} ms for {} lock of slot {}",
                thread,
                waited.as_secs_f64() * 1000.0,
                what,
                self.index
            );
        }
        guard
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("state", &self.status.try_lock().map(|s| s.state))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let slot = FrameSlot::new(0, 16, 0, false);
        let mut status = slot.lock_state("test");
        for to in [
            SlotState::Reading,
            SlotState::Mapped,
            SlotState::Transferring,
            SlotState::NeedsUnmap,
            SlotState::Ready,
            SlotState::NotReady,
        ] {
            assert!(status.transition(to, "test"));
        }
        assert_eq!(status.state(), SlotState::NotReady);
    }

    #[test]
    fn test_only_successor_is_legal() {
        assert!(SlotState::Ready.can_advance_to(SlotState::NotReady));
        assert!(!SlotState::NotReady.can_advance_to(SlotState::Ready));
        assert!(!SlotState::Reading.can_advance_to(SlotState::Transferring));
        assert!(!SlotState::Mapped.can_advance_to(SlotState::Mapped));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal slot transition")]
    fn test_illegal_transition_asserts() {
        let slot = FrameSlot::new(0, 16, 0, false);
        slot.lock_state("test").transition(SlotState::Ready, "test");
    }

    #[test]
    fn test_locks_are_independent() {
        let slot = FrameSlot::new(3, 16, 0, true);
        let image = slot.lock_image("render");
        assert!(slot.try_lock_state().is_some());
        assert_eq!(image.data.len(), 16);
        assert_eq!(slot.index(), 3);
    }

    #[test]
    fn test_state_lock_retries_under_image_lock() {
        let slot = Arc::new(FrameSlot::new(0, 4, 0, true));
        let held = slot.lock_state("output");

        let worker = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                let _image = slot.lock_image("transfer");
                let mut status = slot.lock_state("transfer");
                status.transition(SlotState::Reading, "transfer");
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        assert!(!worker.is_finished());
        drop(held);

        worker.join().unwrap();
        assert_eq!(slot.state(), SlotState::Reading);
        assert!(slot.image.try_lock().is_some());
    }

    #[test]
    fn test_reset_clears_status() {
        let slot = FrameSlot::new(0, 4, 0, false);
        {
            let mut status = slot.lock_state("test");
            status.transition(SlotState::Reading, "test");
            status.locked = true;
            status.failed = true;
            status.reset();
        }
        let status = slot.lock_state("test");
        assert_eq!(status.state(), SlotState::NotReady);
        assert!(!status.locked && !status.failed);
    }
}
