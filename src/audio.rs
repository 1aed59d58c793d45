//! Audio staging
//!
//! Audio rides along with video: `transfer_audio` drops interleaved samples
//! into one of two buffers and the output attaches the newest unconsumed
//! buffer to the next fresh frame. Repeated frames carry no audio. There is
//! no backpressure on this path.

use parking_lot::Mutex;
use std::sync::Arc;

/// Number of staging buffers
pub const AUDIO_BUFFERS: usize = 2;

#[derive(Debug, Default)]
struct Buffers {
    data: [Vec<u8>; AUDIO_BUFFERS],
    /// Buffer the next submit writes into
    write_index: usize,
    /// Buffer holding unconsumed samples
    pending: Option<usize>,
    enabled: bool,
    dropped: u64,
}

/// Double-buffered interleaved audio
#[derive(Debug, Default)]
pub struct AudioStage {
    buffers: Mutex<Buffers>,
}

impl AudioStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `sample_count` sample frames of `frame_bytes` each
    ///
    /// An empty submission turns audio off until samples arrive again.
    pub fn submit(&self, interleaved: &[u8], sample_count: usize, frame_bytes: usize) {
        let mut buffers = self.buffers.lock();
        let len = (sample_count * frame_bytes).min(interleaved.len());
        if len == 0 {
            buffers.enabled = false;
            buffers.pending = None;
            return;
        }
        if buffers.pending.is_some() {
            buffers.dropped += 1;
        }
        let index = buffers.write_index;
        let target = &mut buffers.data[index];
        target.clear();
        target.extend_from_slice(&interleaved[..len]);
        buffers.pending = Some(index);
        buffers.write_index = (index + 1) % AUDIO_BUFFERS;
        buffers.enabled = true;
    }

    /// Newest unconsumed samples, if any
    pub fn take(&self) -> Option<Arc<[u8]>> {
        let mut buffers = self.buffers.lock();
        let index = buffers.pending.take()?;
        Some(Arc::from(buffers.data[index].as_slice()))
    }

    pub fn is_enabled(&self) -> bool {
        self.buffers.lock().enabled
    }

    /// Submissions overwritten before any frame picked them up
    pub fn dropped(&self) -> u64 {
        self.buffers.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_newest_once() {
        let stage = AudioStage::new();
        assert!(stage.take().is_none());

        stage.submit(&[1, 2, 3, 4], 2, 2);
        stage.submit(&[5, 6, 7, 8, 9, 9], 2, 2);
        assert_eq!(stage.dropped(), 1);
        assert_eq!(&*stage.take().unwrap(), &[5, 6, 7, 8]);
        assert!(stage.take().is_none());
        assert!(stage.is_enabled());
    }

    #[test]
    fn test_empty_submit_disables() {
        let stage = AudioStage::new();
        stage.submit(&[1, 2], 1, 2);
        stage.submit(&[], 0, 2);
        assert!(!stage.is_enabled());
        assert!(stage.take().is_none());
    }
}
