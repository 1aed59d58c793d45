//! Fixed set of slots for one video channel

use super::slot::FrameSlot;
use crate::types::FrameLayout;

/// Ring of equally sized slots for one eye / stream
///
/// The layout is fixed for the channel's lifetime; a format change builds a
/// new channel.
#[derive(Debug)]
pub struct VideoChannel {
    name: String,
    buffer_size: usize,
    slots: Vec<FrameSlot>,
}

impl VideoChannel {
    pub fn new(name: impl Into<String>, layout: &FrameLayout, depth: usize, verbose: bool) -> Self {
        let buffer_size = layout.buffer_size_bytes();
        let staging_size = if layout.is_passthrough() {
            0
        } else {
            layout.readback_bytes()
        };
        let slots = (0..depth)
            .map(|i| FrameSlot::new(i, buffer_size, staging_size, verbose))
            .collect();
        Self {
            name: name.into(),
            buffer_size,
            slots,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slot for a ring index; wraps modulo the depth
    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index % self.slots.len()]
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataFormat, Resolution};

    #[test]
    fn test_slots_share_layout() {
        let layout = FrameLayout::new(Resolution::new(6, 2), DataFormat::CbY0CrY1_8, 4);
        let channel = VideoChannel::new("left", &layout, 4, false);
        assert_eq!(channel.depth(), 4);
        assert_eq!(channel.buffer_size(), 24);
        for slot in channel.slots() {
            let image = slot.lock_image("test");
            assert_eq!(image.data.len(), 24);
            // 18 byte rows padded to 20
            assert_eq!(image.staging.len(), 40);
        }
        assert_eq!(channel.slot(5).index(), 1);
    }
}
