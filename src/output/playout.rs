//! Simulated playout card
//!
//! Behaves like an SDI card driven by scheduled frames: frames queue up
//! until playback starts, then one frame is displayed per frame interval and
//! its completion is reported on the card's own thread.

use super::{CompletionResult, PlaybackHandler, ScheduledFrame, ScheduledOutput};
use crate::error::{Error, Result};
use crate::formats::{DataFormatSpec, FormatCatalog, VideoFormat};
use crate::types::Framerate;
use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Default)]
struct CardState {
    handler: Option<Arc<dyn PlaybackHandler>>,
    rate: Framerate,
    queue: VecDeque<ScheduledFrame>,
    displayed: Vec<u64>,
    /// Forced completion results by playout index
    results: HashMap<u64, CompletionResult>,
    underruns: u64,
}

struct Playback {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Software stand-in for a hardware playout card
pub struct SimulatedPlayout {
    name: String,
    catalog: FormatCatalog,
    latency: Duration,
    state: Arc<Mutex<CardState>>,
    playback: Mutex<Option<Playback>>,
}

impl SimulatedPlayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            catalog: FormatCatalog::standard_playout(),
            latency: Duration::ZERO,
            state: Arc::new(Mutex::new(CardState::default())),
            playback: Mutex::new(None),
        }
    }

    pub fn with_catalog(mut self, catalog: FormatCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report `result` instead of `Completed` for the given playout index
    pub fn set_completion_result(&self, playout_index: u64, result: CompletionResult) {
        self.state.lock().results.insert(playout_index, result);
    }

    /// Sequence numbers in display order, repeats included
    pub fn displayed_sequences(&self) -> Vec<u64> {
        self.state.lock().displayed.clone()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Intervals where nothing was scheduled
    pub fn underruns(&self) -> u64 {
        self.state.lock().underruns
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().is_some()
    }

    fn display_next(state: &Mutex<CardState>) {
        let (frame, handler, result) = {
            let mut state = state.lock();
            let Some(frame) = state.queue.pop_front() else {
                state.underruns += 1;
                return;
            };
            let result = state
                .results
                .remove(&frame.playout_index)
                .unwrap_or(CompletionResult::Completed);
            if result != CompletionResult::Dropped {
                state.displayed.push(frame.sequence);
            }
            (frame, state.handler.clone(), result)
        };
        if let Some(handler) = handler {
            handler.scheduled_frame_completed(frame, result);
        }
    }
}

impl ScheduledOutput for SimulatedPlayout {
    fn name(&self) -> &str {
        &self.name
    }

    fn catalog(&self) -> FormatCatalog {
        self.catalog.clone()
    }

    fn enable(
        &self,
        video: &VideoFormat,
        data: &DataFormatSpec,
        handler: Arc<dyn PlaybackHandler>,
    ) -> Result<()> {
        if data.is_stereo() && !video.stereo_capable {
            return Err(Error::Playout(format!(
                "{} does not support stereo output",
                video.description
            )));
        }
        let mut state = self.state.lock();
        state.handler = Some(handler);
        state.rate = video.rate;
        state.queue.clear();
        state.displayed.clear();
        state.underruns = 0;
        tracing::info!("{}: enabled {} {}", self.name, video.description, data.description);
        Ok(())
    }

    fn schedule_frame(&self, frame: ScheduledFrame) -> Result<()> {
        let mut state = self.state.lock();
        if state.handler.is_none() {
            return Err(Error::Playout("output not enabled".into()));
        }
        state.queue.push_back(frame);
        Ok(())
    }

    fn start_playback(&self, start_time: u64, timescale: u64) -> Result<()> {
        let mut playback = self.playback.lock();
        if playback.is_some() {
            return Ok(());
        }
        let interval = self.state.lock().rate.frame_duration();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name("framelink-playout".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => Self::display_next(&state),
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        *playback = Some(Playback {
            stop: stop_tx,
            thread,
        });
        tracing::debug!(
            "{}: playback from {}/{} every {:?}",
            self.name,
            start_time,
            timescale,
            interval
        );
        Ok(())
    }

    fn stop_playback(&self) -> Result<()> {
        let Some(playback) = self.playback.lock().take() else {
            return Ok(());
        };
        let _ = playback.stop.send(());
        playback
            .thread
            .join()
            .map_err(|_| Error::Playout("playout thread panicked".into()))?;

        let (flushed, handler) = {
            let mut state = self.state.lock();
            (state.queue.drain(..).collect::<Vec<_>>(), state.handler.clone())
        };
        if let Some(handler) = handler {
            for frame in flushed {
                handler.scheduled_frame_completed(frame, CompletionResult::Flushed);
            }
            handler.scheduled_playback_stopped();
        }
        Ok(())
    }

    fn disable(&self) {
        let mut state = self.state.lock();
        state.handler = None;
        state.queue.clear();
    }

    fn device_latency(&self) -> Duration {
        self.latency
    }
}

impl Drop for SimulatedPlayout {
    fn drop(&mut self) {
        if let Some(playback) = self.playback.get_mut().take() {
            let _ = playback.stop.send(());
            let _ = playback.thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        completions: Mutex<Vec<(u64, CompletionResult)>>,
        stopped: AtomicBool,
    }

    impl PlaybackHandler for Recorder {
        fn scheduled_frame_completed(&self, frame: ScheduledFrame, result: CompletionResult) {
            self.completions.lock().push((frame.playout_index, result));
        }

        fn scheduled_playback_stopped(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn frame(playout_index: u64) -> ScheduledFrame {
        ScheduledFrame {
            playout_index,
            display_time: playout_index * 1000,
            duration: 1000,
            timescale: 100_000,
            sequence: playout_index,
            slot: None,
            eyes: Vec::new(),
            audio: None,
            repeat: false,
        }
    }

    #[test]
    fn test_completions_and_flush() {
        let card = SimulatedPlayout::new("sim");
        let recorder = Arc::new(Recorder::default());
        let video = VideoFormat::new(
            crate::types::Resolution::HD_720P,
            Framerate::new(100, 1),
            "720p100",
        );
        let catalog = card.catalog();
        card.enable(&video, &catalog.data_formats[0], recorder.clone())
            .unwrap();

        card.set_completion_result(1, CompletionResult::DisplayedLate);
        for i in 0..3 {
            card.schedule_frame(frame(i)).unwrap();
        }
        card.start_playback(0, 100_000).unwrap();
        std::thread::sleep(Duration::from_millis(35));
        card.schedule_frame(frame(3)).unwrap();
        for i in 4..40 {
            card.schedule_frame(frame(i)).unwrap();
        }
        card.stop_playback().unwrap();

        let completions = recorder.completions.lock().clone();
        assert_eq!(completions.len(), 40);
        assert_eq!(completions[0], (0, CompletionResult::Completed));
        assert_eq!(completions[1], (1, CompletionResult::DisplayedLate));
        assert_eq!(completions.last().unwrap().1, CompletionResult::Flushed);
        assert!(recorder.stopped.load(Ordering::SeqCst));
        assert!(!card.is_playing());
    }

    #[test]
    fn test_stereo_needs_capable_format() {
        let card = SimulatedPlayout::new("sim");
        let catalog = card.catalog();
        let uhd = catalog.video_formats.last().unwrap();
        let stereo = catalog.data_formats.iter().find(|d| d.is_stereo()).unwrap();
        let err = card
            .enable(uhd, stereo, Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Playout(_)));
    }
}
