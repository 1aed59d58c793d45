//! Output dispatch
//!
//! Takes `Ready` slots off the ring in sequence order and hands them to the
//! sink. Movie writers are fed by [`WriterDispatch`] on its own thread;
//! playout cards are fed by [`ScheduledDispatch`] from their completion
//! callbacks. Both share [`DispatchCore`].

use super::{
    CompletionResult, FrameWriter, OutputFrame, PlaybackHandler, ScheduledFrame, ScheduledOutput,
};
use crate::audio::AudioStage;
use crate::config::Pacing;
use crate::error::Result;
use crate::profile::Profiler;
use crate::ring::{Ring, SlotState};
use crate::types::{Counters, FrameStamp, Framerate};
use crossbeam_channel::{select, Receiver, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const OUTPUT_THREAD: &str = "output";

/// A frame taken off the ring, still holding its slot
#[derive(Debug, Clone)]
pub struct ReadyFrame {
    pub stamp: FrameStamp,
    pub index: usize,
    pub eyes: Vec<Arc<Vec<u8>>>,
    pub failed: bool,
}

/// Ring access shared by both dispatch modes
pub struct DispatchCore {
    ring: Arc<Ring>,
    counters: Arc<Counters>,
    audio: Arc<AudioStage>,
    profiler: Option<Arc<Profiler>>,
}

impl DispatchCore {
    pub fn new(
        ring: Arc<Ring>,
        counters: Arc<Counters>,
        audio: Arc<AudioStage>,
        profiler: Option<Arc<Profiler>>,
    ) -> Self {
        Self {
            ring,
            counters,
            audio,
            profiler,
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Take the frame at the read cursor if every channel has it ready
    ///
    /// Never blocks: a contended state lock counts as not ready.
    pub fn take_ready(&self) -> Option<ReadyFrame> {
        let cursor = self.ring.cursor();
        let read = cursor.read();
        if read >= cursor.ready() {
            return None;
        }
        let index = self.ring.slot_index(read);

        let mut guards = Vec::with_capacity(self.ring.channels().len());
        for channel in self.ring.channels() {
            let status = channel.slot(index).try_lock_state()?;
            if status.state() != SlotState::Ready || status.locked {
                return None;
            }
            guards.push(status);
        }

        let stamp = guards.first()?.stamp;
        let mut failed = false;
        let mut eyes = Vec::with_capacity(guards.len());
        for status in guards.iter_mut() {
            status.locked = true;
            failed |= status.failed;
            eyes.push(status.output.clone().unwrap_or_default());
        }
        drop(guards);
        cursor.advance_read();

        Some(ReadyFrame {
            stamp,
            index,
            eyes,
            failed,
        })
    }

    /// Hand slot `index` back to the render thread on every channel
    pub fn release(&self, index: usize) {
        for channel in self.ring.channels() {
            let mut status = channel.slot(index).lock_state(OUTPUT_THREAD);
            status.locked = false;
            status.output = None;
            status.transition(SlotState::NotReady, OUTPUT_THREAD);
        }
        self.ring.signal().notify();
    }

    fn take_audio(&self) -> Option<Arc<[u8]>> {
        self.audio.take()
    }

    fn record_output(&self, begin: Instant) {
        if let Some(profiler) = &self.profiler {
            profiler.record_output(begin, Instant::now());
        }
    }
}

/// Feeds a movie writer from the `framelink-output` thread
pub struct WriterDispatch {
    core: Arc<DispatchCore>,
    writer: Box<dyn FrameWriter>,
    pacing: Pacing,
    rate: Framerate,
    latency_frames: f64,
    poll_interval: Duration,
    stop: Receiver<()>,
    last: Option<OutputFrame>,
}

impl WriterDispatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: Arc<DispatchCore>,
        writer: Box<dyn FrameWriter>,
        pacing: Pacing,
        rate: Framerate,
        latency_frames: f64,
        poll_interval: Duration,
        stop: Receiver<()>,
    ) -> Self {
        Self {
            core,
            writer,
            pacing,
            rate,
            latency_frames,
            poll_interval,
            stop,
            last: None,
        }
    }

    /// Start the thread; joining it hands the writer back
    pub fn spawn(self) -> Result<JoinHandle<Box<dyn FrameWriter>>> {
        let handle = std::thread::Builder::new()
            .name("framelink-output".into())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run(mut self) -> Box<dyn FrameWriter> {
        tracing::debug!("Output thread started ({:?})", self.pacing);
        match self.pacing {
            Pacing::Unpaced => self.run_unpaced(),
            Pacing::Realtime => self.run_realtime(),
        }

        let mut drained = 0usize;
        while let Some(frame) = self.core.take_ready() {
            self.emit(frame);
            drained += 1;
        }
        tracing::debug!(
            "Output thread stopped ({} frames written, {} drained)",
            self.writer.frames_written(),
            drained
        );
        self.writer
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    fn run_unpaced(&mut self) {
        while !self.stop_requested() {
            let seen = self.core.ring().signal().generation();
            match self.core.take_ready() {
                Some(frame) => self.emit(frame),
                None => {
                    self.core.ring().signal().wait_for(seen, self.poll_interval);
                }
            }
        }
    }

    fn run_realtime(&mut self) {
        let first = loop {
            if self.stop_requested() {
                return;
            }
            let seen = self.core.ring().signal().generation();
            if let Some(frame) = self.core.take_ready() {
                break frame;
            }
            self.core.ring().signal().wait_for(seen, self.poll_interval);
        };

        let stop = self.stop.clone();
        let interval = self.rate.frame_duration();
        let start = crossbeam_channel::after(interval.mul_f64(self.latency_frames.max(0.0)));
        let stopped = select! {
            recv(start) -> _ => false,
            recv(stop) -> _ => true,
        };
        self.emit(first);
        if stopped {
            return;
        }

        let ticker = crossbeam_channel::tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => match self.core.take_ready() {
                    Some(frame) => self.emit(frame),
                    None => self.repeat_last(),
                },
                recv(stop) -> _ => return,
            }
        }
    }

    /// Write a fresh frame, or a repeat if its transfer failed
    fn emit(&mut self, frame: ReadyFrame) {
        if frame.failed {
            tracing::debug!("Frame {} failed, repeating previous frame", frame.stamp.sequence);
            self.core.release(frame.index);
            self.repeat_last();
            return;
        }

        let out = OutputFrame {
            sequence: frame.stamp.sequence,
            time: frame.stamp.time,
            eyes: frame.eyes,
            audio: self.core.take_audio(),
            repeat: false,
        };
        let begin = Instant::now();
        match self.writer.write(&out) {
            Ok(()) => Counters::bump(&self.core.counters.frames_output),
            Err(e) => tracing::warn!("{}: writing frame {} failed: {}", self.writer.name(), out.sequence, e),
        }
        self.core.record_output(begin);
        self.core.release(frame.index);
        self.last = Some(OutputFrame { audio: None, ..out });
    }

    fn repeat_last(&mut self) {
        let Some(last) = &self.last else {
            return;
        };
        let repeat = OutputFrame {
            repeat: true,
            ..last.clone()
        };
        if let Err(e) = self.writer.write(&repeat) {
            tracing::warn!("{}: repeating frame {} failed: {}", self.writer.name(), repeat.sequence, e);
            return;
        }
        Counters::bump(&self.core.counters.frames_repeated);
    }
}

#[derive(Default)]
struct PlayoutState {
    started: bool,
    stopping: bool,
    next_playout: u64,
    /// Fresh frames scheduled and not yet completed
    fresh_in_flight: usize,
    last: Option<ScheduledFrame>,
}

/// Scheduling decision taken under the state lock, carried out after it
struct Plan {
    /// Slot of a failed frame to hand back
    release: Option<usize>,
    frame: Option<ScheduledFrame>,
}

/// Feeds a playout card from its completion callbacks
pub struct ScheduledDispatch {
    core: Arc<DispatchCore>,
    output: Arc<dyn ScheduledOutput>,
    rate: Framerate,
    preroll: usize,
    state: Mutex<PlayoutState>,
    stopped: AtomicBool,
}

impl ScheduledDispatch {
    pub fn new(
        core: Arc<DispatchCore>,
        output: Arc<dyn ScheduledOutput>,
        rate: Framerate,
        preroll: usize,
    ) -> Self {
        Self {
            core,
            output,
            rate,
            preroll: preroll.max(1),
            state: Mutex::new(PlayoutState::default()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn playback_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Called by the transfer thread after each ready frame
    pub fn on_frame_ready(&self) {
        let mut state = self.state.lock();
        if state.started || state.stopping {
            return;
        }
        let cursor = self.core.ring().cursor();
        if cursor.ready() - cursor.read() >= self.preroll as u64 {
            self.start_locked(&mut state);
        }
    }

    /// Schedule the preroll and start the card
    ///
    /// Completions only arrive once playback runs, so the preroll is handed
    /// to the card with the state lock held.
    fn start_locked(&self, state: &mut PlayoutState) {
        for _ in 0..self.preroll {
            match self.core.take_ready() {
                Some(frame) => {
                    let plan = self.plan_ready(state, frame);
                    if !self.commit(plan) {
                        state.fresh_in_flight = state.fresh_in_flight.saturating_sub(1);
                    }
                }
                None => break,
            }
        }
        if state.next_playout == 0 {
            return;
        }
        let (timescale, _) = self.rate.timescale();
        match self.output.start_playback(0, timescale) {
            Ok(()) => {
                state.started = true;
                tracing::info!(
                    "{}: playback started after {} preroll frames",
                    self.output.name(),
                    state.next_playout
                );
            }
            Err(e) => tracing::error!("{}: starting playback failed: {}", self.output.name(), e),
        }
    }

    fn next_frame(&self, state: &mut PlayoutState, sequence: u64) -> ScheduledFrame {
        let (timescale, duration) = self.rate.timescale();
        let playout_index = state.next_playout;
        state.next_playout += 1;
        ScheduledFrame {
            playout_index,
            display_time: playout_index * duration,
            duration,
            timescale,
            sequence,
            slot: None,
            eyes: Vec::new(),
            audio: None,
            repeat: false,
        }
    }

    /// Pick the next frame to schedule; the card is not touched here
    fn plan_ready(&self, state: &mut PlayoutState, frame: ReadyFrame) -> Plan {
        if frame.failed {
            tracing::debug!("Frame {} failed, repeating previous frame", frame.stamp.sequence);
            return Plan {
                release: Some(frame.index),
                frame: self.plan_repeat(state),
            };
        }
        let mut scheduled = self.next_frame(state, frame.stamp.sequence);
        scheduled.slot = Some(frame.index);
        scheduled.eyes = frame.eyes;
        scheduled.audio = self.core.take_audio();

        state.last = Some(ScheduledFrame {
            slot: None,
            audio: None,
            ..scheduled.clone()
        });
        state.fresh_in_flight += 1;
        Plan {
            release: None,
            frame: Some(scheduled),
        }
    }

    fn plan_repeat(&self, state: &mut PlayoutState) -> Option<ScheduledFrame> {
        let last = state.last.clone()?;
        let mut repeat = self.next_frame(state, last.sequence);
        repeat.eyes = last.eyes;
        repeat.repeat = true;
        Some(repeat)
    }

    /// Carry out a plan
    ///
    /// Returns `false` when the card rejected a fresh frame; its slot has
    /// been handed back and the caller must drop it from `fresh_in_flight`.
    fn commit(&self, plan: Plan) -> bool {
        if let Some(index) = plan.release {
            self.core.release(index);
        }
        let Some(frame) = plan.frame else {
            return true;
        };
        let (slot, repeat) = (frame.slot, frame.repeat);
        match self.output.schedule_frame(frame) {
            Ok(()) => {
                let counter = if repeat {
                    &self.core.counters.frames_repeated
                } else {
                    &self.core.counters.frames_output
                };
                Counters::bump(counter);
                true
            }
            Err(e) => {
                tracing::warn!("{}: scheduling frame failed: {}", self.output.name(), e);
                match slot {
                    Some(index) => {
                        self.core.release(index);
                        false
                    }
                    None => true,
                }
            }
        }
    }

    /// Start playback with whatever is ready, then wait for the ring to empty
    pub fn drain(&self, timeout: Duration, poll: Duration) -> bool {
        {
            let mut state = self.state.lock();
            if !state.started {
                self.start_locked(&mut state);
            }
        }
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.core.ring().signal().generation();
            let done = {
                let state = self.state.lock();
                let cursor = self.core.ring().cursor();
                !state.started || (cursor.read() == cursor.ready() && state.fresh_in_flight == 0)
            };
            if done {
                return true;
            }
            if self.playback_stopped() || Instant::now() >= deadline {
                return false;
            }
            self.core.ring().signal().wait_for(seen, poll);
        }
    }

    /// Stop scheduling and halt the card
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        if let Err(e) = self.output.stop_playback() {
            tracing::warn!("{}: stopping playback failed: {}", self.output.name(), e);
        }
        self.output.disable();
    }
}

impl PlaybackHandler for ScheduledDispatch {
    fn scheduled_frame_completed(&self, frame: ScheduledFrame, result: CompletionResult) {
        match result {
            CompletionResult::DisplayedLate => Counters::bump(&self.core.counters.frames_late),
            CompletionResult::Dropped => Counters::bump(&self.core.counters.frames_dropped),
            CompletionResult::Completed | CompletionResult::Flushed => {}
        }

        if let Some(index) = frame.slot {
            self.core.release(index);
        }
        let plan = {
            let mut state = self.state.lock();
            if frame.slot.is_some() {
                state.fresh_in_flight = state.fresh_in_flight.saturating_sub(1);
            }
            if result == CompletionResult::Flushed || state.stopping {
                return;
            }
            match self.core.take_ready() {
                Some(next) => self.plan_ready(&mut state, next),
                None => Plan {
                    release: None,
                    frame: self.plan_repeat(&mut state),
                },
            }
        };
        if !self.commit(plan) {
            let mut state = self.state.lock();
            state.fresh_in_flight = state.fresh_in_flight.saturating_sub(1);
        }
    }

    fn scheduled_playback_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.core.ring().signal().notify();
        tracing::debug!("{}: playback stopped", self.output.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{DataFormatSpec, FormatCatalog, VideoFormat};
    use crate::output::{MemoryWriter, SimulatedPlayout};
    use crate::types::{DataFormat, FrameLayout, Resolution};
    use std::collections::VecDeque;

    /// Card whose display ticks are driven by the test
    #[derive(Default)]
    struct ManualCard {
        queue: Mutex<VecDeque<ScheduledFrame>>,
        history: Mutex<Vec<(u64, u64, bool)>>,
    }

    impl ManualCard {
        /// Display the oldest scheduled frame and report it as `result`
        fn tick(&self, dispatch: &ScheduledDispatch, result: CompletionResult) {
            let frame = self.queue.lock().pop_front().unwrap();
            dispatch.scheduled_frame_completed(frame, result);
        }

        fn sequences(&self) -> Vec<u64> {
            self.history.lock().iter().map(|h| h.1).collect()
        }
    }

    impl ScheduledOutput for ManualCard {
        fn name(&self) -> &str {
            "manual"
        }

        fn catalog(&self) -> FormatCatalog {
            FormatCatalog::standard_playout()
        }

        fn enable(
            &self,
            _video: &VideoFormat,
            _data: &DataFormatSpec,
            _handler: Arc<dyn PlaybackHandler>,
        ) -> Result<()> {
            Ok(())
        }

        fn schedule_frame(&self, frame: ScheduledFrame) -> Result<()> {
            self.history
                .lock()
                .push((frame.playout_index, frame.sequence, frame.repeat));
            self.queue.lock().push_back(frame);
            Ok(())
        }

        fn start_playback(&self, _start_time: u64, _timescale: u64) -> Result<()> {
            Ok(())
        }

        fn stop_playback(&self) -> Result<()> {
            Ok(())
        }

        fn disable(&self) {}
    }

    fn ring_with_ready(depth: usize, stereo: bool, count: u64) -> Arc<Ring> {
        let layout = FrameLayout::new(Resolution::new(2, 2), DataFormat::Rgba8, 4);
        let ring = Arc::new(Ring::new(layout, depth, stereo, false));
        for sequence in 0..count {
            publish(&ring, sequence, false);
        }
        ring
    }

    /// Walk a slot to `Ready` the way the transfer thread does
    fn publish(ring: &Ring, sequence: u64, failed: bool) {
        let index = ring.slot_index(sequence);
        ring.cursor().advance_write();
        for channel in ring.channels() {
            let mut status = channel.slot(index).lock_state("test");
            for to in [
                SlotState::Reading,
                SlotState::Mapped,
                SlotState::Transferring,
                SlotState::NeedsUnmap,
                SlotState::Ready,
            ] {
                status.transition(to, "test");
            }
            status.stamp = FrameStamp {
                sequence,
                time: sequence as f64 / 24.0,
            };
            status.failed = failed;
            status.output = Some(Arc::new(vec![sequence as u8; 16]));
        }
        ring.cursor().advance_ready();
    }

    fn core(ring: &Arc<Ring>) -> (Arc<DispatchCore>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let core = Arc::new(DispatchCore::new(
            ring.clone(),
            counters.clone(),
            Arc::new(AudioStage::new()),
            None,
        ));
        (core, counters)
    }

    #[test]
    fn test_take_and_release() {
        let ring = ring_with_ready(3, true, 2);
        let (core, _) = core(&ring);

        let first = core.take_ready().unwrap();
        assert_eq!(first.stamp.sequence, 0);
        assert_eq!(first.eyes.len(), 2);
        assert!(ring.channels()[1].slot(0).lock_state("test").locked);

        let second = core.take_ready().unwrap();
        assert_eq!(second.index, 1);
        assert!(core.take_ready().is_none());

        core.release(first.index);
        assert!(ring.is_free(0));
        assert!(!ring.is_free(1));
        assert_eq!(ring.cursor().read(), 2);
    }

    #[test]
    fn test_unpaced_writer_drains_on_stop() {
        let ring = ring_with_ready(4, false, 3);
        let (core, counters) = core(&ring);
        let (writer, capture) = MemoryWriter::new();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle = WriterDispatch::new(
            core,
            Box::new(writer),
            Pacing::Unpaced,
            Framerate::FPS_24,
            0.5,
            Duration::from_millis(2),
            stop_rx,
        )
        .spawn()
        .unwrap();

        stop_tx.send(()).unwrap();
        let writer = handle.join().unwrap();
        assert_eq!(writer.frames_written(), 3);
        assert_eq!(capture.sequences(), vec![0, 1, 2]);
        assert_eq!(counters.snapshot().frames_output, 3);
        assert!((0..3).all(|i| ring.is_free(i)));
    }

    #[test]
    fn test_failed_frame_repeats_previous() {
        let layout = FrameLayout::new(Resolution::new(2, 2), DataFormat::Rgba8, 4);
        let ring = Arc::new(Ring::new(layout, 4, false, false));
        publish(&ring, 0, false);
        publish(&ring, 1, true);
        publish(&ring, 2, false);
        let (core, counters) = core(&ring);
        let (writer, capture) = MemoryWriter::new();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        stop_tx.send(()).unwrap();
        WriterDispatch::new(
            core,
            Box::new(writer),
            Pacing::Unpaced,
            Framerate::FPS_24,
            0.5,
            Duration::from_millis(2),
            stop_rx,
        )
        .spawn()
        .unwrap()
        .join()
        .unwrap();

        assert_eq!(capture.sequences(), vec![0, 0, 2]);
        assert_eq!(capture.repeats(), 1);
        assert_eq!(counters.snapshot().frames_repeated, 1);
    }

    #[test]
    fn test_realtime_repeats_on_underrun() {
        let ring = ring_with_ready(4, false, 1);
        let (core, counters) = core(&ring);
        let (writer, capture) = MemoryWriter::new();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle = WriterDispatch::new(
            core,
            Box::new(writer),
            Pacing::Realtime,
            Framerate::new(100, 1),
            0.0,
            Duration::from_millis(1),
            stop_rx,
        )
        .spawn()
        .unwrap();

        std::thread::sleep(Duration::from_millis(55));
        publish(&ring, 1, false);
        std::thread::sleep(Duration::from_millis(30));
        stop_tx.send(()).unwrap();
        handle.join().unwrap();

        let sequences = capture.sequences();
        assert_eq!(sequences.first(), Some(&0));
        assert!(sequences.contains(&1));
        assert!(sequences.windows(2).all(|w| w[0] <= w[1]));
        let repeats = counters.snapshot().frames_repeated;
        assert!((4..=10).contains(&repeats), "repeats = {}", repeats);
    }

    #[test]
    fn test_scheduled_preroll_and_recycle() {
        let ring = ring_with_ready(5, false, 0);
        let (core, counters) = core(&ring);
        let card = Arc::new(SimulatedPlayout::new("sim"));
        let dispatch = Arc::new(ScheduledDispatch::new(
            core,
            card.clone(),
            Framerate::new(200, 1),
            3,
        ));
        let catalog = card.catalog();
        card.enable(
            &catalog.video_formats[0],
            &catalog.data_formats[0],
            dispatch.clone(),
        )
        .unwrap();

        for sequence in 0..2 {
            publish(&ring, sequence, false);
            dispatch.on_frame_ready();
        }
        assert!(!dispatch.is_started());
        publish(&ring, 2, false);
        dispatch.on_frame_ready();
        assert!(dispatch.is_started());

        for sequence in 3..6 {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !ring.is_free(ring.slot_index(sequence)) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            publish(&ring, sequence, false);
        }
        assert!(dispatch.drain(Duration::from_secs(2), Duration::from_millis(2)));
        dispatch.stop();

        let shown = card.displayed_sequences();
        let fresh: Vec<u64> = {
            let mut fresh = shown.clone();
            fresh.dedup();
            fresh
        };
        assert_eq!(fresh, vec![0, 1, 2, 3, 4, 5]);
        assert!(shown.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(counters.snapshot().frames_output, 6);
        assert!((0..5).all(|i| ring.is_free(i)));
    }

    #[test]
    fn test_completions_repeat_on_underrun() {
        let layout = FrameLayout::new(Resolution::new(2, 2), DataFormat::Rgba8, 4);
        let ring = Arc::new(Ring::new(layout, 4, false, false));
        let (core, counters) = core(&ring);
        let card = Arc::new(ManualCard::default());
        let dispatch = ScheduledDispatch::new(core, card.clone(), Framerate::new(100, 1), 2);

        publish(&ring, 0, false);
        dispatch.on_frame_ready();
        publish(&ring, 1, false);
        dispatch.on_frame_ready();
        assert!(dispatch.is_started());
        publish(&ring, 2, false);
        card.tick(&dispatch, CompletionResult::Completed);

        // nothing rendered for five display intervals
        for _ in 0..5 {
            card.tick(&dispatch, CompletionResult::Completed);
        }
        assert_eq!(counters.snapshot().frames_repeated, 5);

        publish(&ring, 3, false);
        card.tick(&dispatch, CompletionResult::Completed);
        assert_eq!(card.sequences(), vec![0, 1, 2, 2, 2, 2, 2, 2, 3]);
        let history = card.history.lock().clone();
        assert!(history.iter().enumerate().all(|(i, h)| h.0 == i as u64));
        assert_eq!(history.iter().filter(|h| h.2).count(), 5);
        assert_eq!(counters.snapshot().frames_output, 4);
    }

    #[test]
    fn test_completion_results_and_failed_frames() {
        let layout = FrameLayout::new(Resolution::new(2, 2), DataFormat::Rgba8, 4);
        let ring = Arc::new(Ring::new(layout, 4, false, false));
        let (core, counters) = core(&ring);
        let card = Arc::new(ManualCard::default());
        let dispatch = ScheduledDispatch::new(core, card.clone(), Framerate::new(100, 1), 2);

        publish(&ring, 0, false);
        publish(&ring, 1, false);
        dispatch.on_frame_ready();
        assert!(dispatch.is_started());

        card.tick(&dispatch, CompletionResult::DisplayedLate);
        card.tick(&dispatch, CompletionResult::Dropped);
        let stats = counters.snapshot();
        assert_eq!((stats.frames_late, stats.frames_dropped), (1, 1));
        assert_eq!(stats.frames_repeated, 2);
        assert!(ring.is_free(0) && ring.is_free(1));

        publish(&ring, 2, true);
        publish(&ring, 3, false);
        card.tick(&dispatch, CompletionResult::Completed);
        card.tick(&dispatch, CompletionResult::Completed);
        assert_eq!(card.sequences(), vec![0, 1, 1, 1, 1, 3]);
        assert!(ring.is_free(2));
        assert_eq!(counters.snapshot().frames_repeated, 3);

        card.tick(&dispatch, CompletionResult::Completed);
        card.tick(&dispatch, CompletionResult::Completed);
        assert!((0..4).all(|i| ring.is_free(i)));
        assert_eq!(counters.snapshot().frames_output, 3);
    }
}
