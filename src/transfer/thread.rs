//! Background transfer thread
//!
//! Finishes frames started on the render thread in submission order.

use super::{TransferEngine, TransferOutcome};
use crate::error::Result;
use crate::pipeline::PipelineControl;
use crate::ring::Ring;
use crate::types::Counters;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One submitted frame covering every channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransfer {
    /// Value of the write cursor when the frame was submitted
    pub sequence: u64,
    pub index: usize,
}

/// FIFO of frames waiting for the transfer thread
#[derive(Debug, Default)]
pub struct TransferQueue {
    items: Mutex<VecDeque<PendingTransfer>>,
    cond: Condvar,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: PendingTransfer) {
        self.items.lock().push_back(item);
        self.cond.notify_one();
    }

    /// Pop the oldest item, waiting at most `timeout` for one
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PendingTransfer> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.cond.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    pub fn try_pop(&self) -> Option<PendingTransfer> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Wake the thread so it notices a stop request
    pub fn wake(&self) {
        self.cond.notify_all();
    }
}

/// Called after every frame that became ready
pub type FrameReadyHook = Arc<dyn Fn() + Send + Sync>;

/// Everything the transfer thread works with
pub struct TransferWorker {
    pub engine: Arc<TransferEngine>,
    pub ring: Arc<Ring>,
    pub queue: Arc<TransferQueue>,
    pub control: Arc<PipelineControl>,
    pub counters: Arc<Counters>,
    pub on_frame_ready: Option<FrameReadyHook>,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl TransferWorker {
    fn run(self) {
        tracing::debug!("Transfer thread started");
        while !self.control.is_stopping() {
            let Some(item) = self.queue.pop_timeout(self.poll_interval) else {
                continue;
            };
            if self.finish(item).is_err() {
                return;
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut drained = 0usize;
        while let Some(item) = self.queue.try_pop() {
            if Instant::now() >= deadline {
                tracing::error!(
                    "Transfer drain timed out with {} frames left",
                    self.queue.len() + 1
                );
                self.control.fail("transfer drain timed out");
                break;
            }
            if self.finish(item).is_err() {
                return;
            }
            drained += 1;
        }
        tracing::debug!("Transfer thread stopped ({} frames drained)", drained);
    }

    fn finish(&self, item: PendingTransfer) -> Result<()> {
        debug_assert_eq!(item.sequence, self.ring.cursor().ready());
        let mut failed = false;
        for channel in self.ring.channels() {
            match self.engine.complete_transfer(channel, item.index) {
                Ok(TransferOutcome::Complete) => {}
                Ok(TransferOutcome::Failed) => failed = true,
                Err(e) => {
                    tracing::error!("Frame {} transfer failed: {}", item.sequence, e);
                    self.control.fail(e.to_string());
                    self.ring.signal().notify();
                    return Err(e);
                }
            }
        }

        self.ring.cursor().advance_ready();
        if failed {
            Counters::bump(&self.counters.frames_failed);
        } else {
            Counters::bump(&self.counters.frames_transferred);
        }
        self.ring.signal().notify();
        if let Some(hook) = &self.on_frame_ready {
            hook();
        }
        Ok(())
    }
}

/// Start the `framelink-transfer` thread
pub fn spawn_transfer_thread(worker: TransferWorker) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("framelink-transfer".into())
        .spawn(move || worker.run())?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferMethod;
    use crate::gpu::{GpuBackend, SoftwareGpu, SoftwareGpuConfig};
    use crate::ring::SlotState;
    use crate::transfer::WaitBounds;
    use crate::types::{DataFormat, FrameLayout, FrameStamp, Resolution};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_queue_is_fifo() {
        let queue = TransferQueue::new();
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
        for sequence in 0..3 {
            queue.push(PendingTransfer {
                sequence,
                index: sequence as usize,
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().map(|p| p.sequence), Some(0));
        assert_eq!(queue.pop_timeout(Duration::ZERO).map(|p| p.sequence), Some(1));
    }

    #[test]
    fn test_thread_completes_and_drains() {
        let soft = Arc::new(SoftwareGpu::new(
            SoftwareGpuConfig::default().with_fence_latency(Duration::from_millis(2)),
        ));
        let gpu: Arc<dyn GpuBackend> = soft.clone();
        let layout = FrameLayout::new(Resolution::new(4, 2), DataFormat::Rgba8, 4);
        let ring = Arc::new(Ring::new(layout, 3, true, false));
        let counters = Arc::new(Counters::default());
        let bounds = WaitBounds {
            fence_timeout: Duration::from_millis(50),
            fence_retries: 4,
            poll_interval: Duration::from_millis(2),
            backpressure_timeout: Duration::from_millis(100),
        };
        let mut engine = TransferEngine::new(gpu, layout, TransferMethod::Pbo, bounds, counters.clone());
        engine.prepare(&ring).unwrap();
        let engine = Arc::new(engine);
        let queue = Arc::new(TransferQueue::new());
        let control = Arc::new(PipelineControl::new());
        let ready_calls = Arc::new(AtomicUsize::new(0));
        let calls = ready_calls.clone();

        let handle = spawn_transfer_thread(TransferWorker {
            engine: engine.clone(),
            ring: ring.clone(),
            queue: queue.clone(),
            control: control.clone(),
            counters: counters.clone(),
            on_frame_ready: Some(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })),
            poll_interval: Duration::from_millis(2),
            drain_timeout: Duration::from_secs(2),
        })
        .unwrap();

        let fbo = soft.create_framebuffer(Resolution::new(4, 2), DataFormat::Rgba8);
        for sequence in 0..3u64 {
            soft.fill(&fbo, sequence as u8 + 1).unwrap();
            let index = ring.slot_index(sequence);
            let stamp = FrameStamp {
                sequence,
                time: 0.0,
            };
            for channel in ring.channels() {
                engine.transfer_channel(channel, index, &fbo, stamp).unwrap();
            }
            ring.cursor().advance_write();
            queue.push(PendingTransfer { sequence, index });
        }
        control.request_stop();
        queue.wake();
        handle.join().unwrap();

        assert_eq!(ring.cursor().ready(), 3);
        assert_eq!(ready_calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.snapshot().frames_transferred, 3);
        for channel in ring.channels() {
            let status = channel.slot(2).lock_state("test");
            assert_eq!(status.state(), SlotState::Ready);
            assert_eq!(status.output.as_ref().unwrap()[0], 3);
        }
        assert_eq!(soft.live_fences(), 0);
        assert!(!soft.is_in_external_readback(&fbo));
    }
}
