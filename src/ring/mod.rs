//! Frame ring buffer
//!
//! Every channel owns `depth` slots. Three monotonically increasing counters
//! track the ring:
//! - `write`: frames submitted by the render thread
//! - `ready`: frames whose pixels reached host memory
//! - `read`: frames taken by the output
//!
//! A counter maps to a slot by `counter % depth`, and `read <= ready <=
//! write <= read + depth` holds at all times.

mod channel;
mod slot;

pub use channel::VideoChannel;
pub use slot::{FrameSlot, SlotImage, SlotState, SlotStatus};

use crate::types::FrameLayout;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Ring position counters
#[derive(Debug)]
pub struct RingCursor {
    depth: u64,
    write: AtomicU64,
    ready: AtomicU64,
    read: AtomicU64,
}

impl RingCursor {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth as u64,
            write: AtomicU64::new(0),
            ready: AtomicU64::new(0),
            read: AtomicU64::new(0),
        }
    }

    pub fn write(&self) -> u64 {
        self.write.load(Ordering::Acquire)
    }

    pub fn ready(&self) -> u64 {
        self.ready.load(Ordering::Acquire)
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    /// Frames submitted but not yet taken by the output
    pub fn in_flight(&self) -> u64 {
        self.write().saturating_sub(self.read())
    }

    pub(crate) fn advance_write(&self) -> u64 {
        let previous = self.write.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous + 1 - self.read() <= self.depth);
        previous
    }

    pub(crate) fn advance_ready(&self) -> u64 {
        self.ready.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn advance_read(&self) -> u64 {
        self.read.fetch_add(1, Ordering::AcqRel)
    }
}

/// Generation counter plus condvar for "something in the ring moved"
///
/// Waiters read the generation, check their condition, then wait for the
/// generation to change with a bounded timeout.
#[derive(Debug, Default)]
pub struct WaitSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait until the generation differs from `seen` or `timeout` passes
    pub fn wait_for(&self, seen: u64, timeout: Duration) -> bool {
        let mut generation = self.generation.lock();
        if *generation != seen {
            return true;
        }
        self.cond.wait_for(&mut generation, timeout);
        *generation != seen
    }
}

/// Channels plus the shared cursor of one pipeline
#[derive(Debug)]
pub struct Ring {
    layout: FrameLayout,
    channels: Vec<VideoChannel>,
    cursor: RingCursor,
    signal: WaitSignal,
}

impl Ring {
    pub fn new(layout: FrameLayout, depth: usize, stereo: bool, verbose: bool) -> Self {
        let names: &[&str] = if stereo { &["left", "right"] } else { &["main"] };
        let channels = names
            .iter()
            .map(|name| VideoChannel::new(*name, &layout, depth, verbose))
            .collect();
        Self {
            layout,
            channels,
            cursor: RingCursor::new(depth),
            signal: WaitSignal::new(),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn channels(&self) -> &[VideoChannel] {
        &self.channels
    }

    pub fn depth(&self) -> usize {
        self.channels.first().map_or(0, |c| c.depth())
    }

    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    pub fn signal(&self) -> &WaitSignal {
        &self.signal
    }

    pub fn slot_index(&self, counter: u64) -> usize {
        (counter % self.depth() as u64) as usize
    }

    /// Every channel's slot at `index` is `NotReady`
    pub fn is_free(&self, index: usize) -> bool {
        self.channels
            .iter()
            .all(|c| c.slot(index).state() == SlotState::NotReady)
    }

    /// Force every slot back to `NotReady` and drop its GPU handles
    pub fn reset(&self) {
        for channel in &self.channels {
            for slot in channel.slots() {
                let mut image = slot.lock_image("teardown");
                image.mapped = None;
                image.fence = None;
                slot.lock_state("teardown").reset();
            }
        }
    }

    /// Drop every PBO; must run after the worker threads are gone
    pub fn release_gpu_resources(&self) {
        for channel in &self.channels {
            for slot in channel.slots() {
                let mut image = slot.lock_image("teardown");
                image.mapped = None;
                image.fence = None;
                image.pbo = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataFormat, Resolution};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_cursor_counts() {
        let cursor = RingCursor::new(3);
        cursor.advance_write();
        cursor.advance_write();
        cursor.advance_ready();
        assert_eq!(cursor.in_flight(), 2);
        cursor.advance_read();
        assert_eq!(cursor.in_flight(), 1);
        assert_eq!((cursor.write(), cursor.ready(), cursor.read()), (2, 1, 1));
    }

    #[test]
    fn test_wait_signal_wakes() {
        let signal = Arc::new(WaitSignal::new());
        let seen = signal.generation();
        let notifier = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        let start = Instant::now();
        let mut changed = false;
        while !changed && start.elapsed() < Duration::from_secs(2) {
            changed = signal.wait_for(seen, Duration::from_millis(50));
        }
        assert!(changed);
        handle.join().unwrap();
    }

    #[test]
    fn test_stereo_ring() {
        let layout = FrameLayout::new(Resolution::new(4, 4), DataFormat::Rgba8, 4);
        let ring = Ring::new(layout, 4, true, false);
        assert_eq!(ring.channels().len(), 2);
        assert_eq!(ring.channels()[1].name(), "right");
        assert_eq!(ring.slot_index(9), 1);
        assert!(ring.is_free(1));
    }
}
