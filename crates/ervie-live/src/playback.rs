//! Gapless playback of decoded remote audio.
//!
//! The scheduler keeps a "next start" cursor on the output's audio clock and hands each
//! frame to the device's own timed playback; it never sleeps to wait for a start time.
//! Items stay in the in-flight set until the sink reports them finished or a flush stops them.

use crate::codec::AudioFrame;
use crate::config::PlaybackConfig;
use crate::error::{VoiceError, VoiceResult};
use rodio::buffer::SamplesBuffer;
use rodio::source::{EmptyCallback, Zero};
use rodio::{OutputStream, OutputStreamHandle, Sample, Sink, Source};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ItemId = u64;

/// A decoded frame plus its absolute start time on the output clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub id: ItemId,
    pub frame: AudioFrame,
    pub start: f64,
}

impl PlaybackItem {
    pub fn end(&self) -> f64 {
        self.start + self.frame.duration_secs()
    }
}

/// The audio subsystem's timed-playback primitive.
pub trait OutputSink: Send {
    /// Output clock, in seconds.
    fn now(&self) -> f64;

    /// Start `item` at `item.start`. When it finishes the sink reports `item.id` on the
    /// completion channel it was opened with.
    fn play_at(&mut self, item: &PlaybackItem) -> VoiceResult<()>;

    /// Stop everything queued. Stopped items never report completion.
    fn stop(&mut self);
}

/// Opens the output device for one session.
///
/// `open` may block while the device comes up, so the engine calls it from the blocking pool.
pub trait OutputBackend: Send + Sync {
    fn open(
        &self,
        config: &PlaybackConfig,
        completions: mpsc::UnboundedSender<ItemId>,
    ) -> VoiceResult<Box<dyn OutputSink>>;
}

/// FIFO, gapless scheduler over an [`OutputSink`].
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    cursor: f64,
    in_flight: BTreeMap<ItemId, PlaybackItem>,
    next_id: ItemId,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        let cursor = sink.now();
        Self {
            sink,
            cursor,
            in_flight: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Queue `frame` right after everything already scheduled, or now if the queue has drained.
    ///
    /// A late frame leaves an audible gap; it never overlaps its predecessor.
    pub fn schedule(&mut self, frame: AudioFrame) -> VoiceResult<PlaybackItem> {
        let start = self.cursor.max(self.sink.now());
        let item = PlaybackItem {
            id: self.next_id,
            frame,
            start,
        };
        self.sink.play_at(&item)?;
        self.next_id += 1;
        self.cursor = item.end();
        debug!(
            "Scheduled playback item {} at {:.3}s for {:.3}s",
            item.id,
            item.start,
            item.frame.duration_secs()
        );
        self.in_flight.insert(item.id, item.clone());
        Ok(item)
    }

    /// Completion callback: the item finished on its own. Unknown ids (already flushed) are ignored.
    pub fn complete(&mut self, id: ItemId) -> bool {
        self.in_flight.remove(&id).is_some()
    }

    /// Stop every in-flight item and rewind the cursor to now. Returns how many were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.in_flight.len();
        if stopped > 0 {
            self.in_flight.clear();
            self.sink.stop();
            info!("⏹️ Playback flushed ({} item(s))", stopped);
        }
        self.cursor = self.sink.now();
        stopped
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn now(&self) -> f64 {
        self.sink.now()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &PlaybackItem> {
        self.in_flight.values()
    }

    pub fn is_playing(&self) -> bool {
        !self.in_flight.is_empty()
    }
}

/// Samples the mixer has pulled from a sink, shared with the sources that feed it.
///
/// The output clock is this count over the output format, so it only moves while audio is
/// actually being consumed.
#[derive(Debug, Clone)]
pub struct AudioClock {
    samples: Arc<AtomicU64>,
    samples_per_sec: f64,
}

impl AudioClock {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::new(AtomicU64::new(0)),
            samples_per_sec: (sample_rate as f64 * channels.max(1) as f64).max(1.0),
        }
    }

    pub fn now(&self) -> f64 {
        self.samples.load(Ordering::Relaxed) as f64 / self.samples_per_sec
    }

    /// Wrap `source` so every sample it yields advances the clock.
    pub fn counted<S>(&self, source: S) -> Counted<S> {
        Counted {
            inner: source,
            samples: Arc::clone(&self.samples),
        }
    }
}

/// A source that ticks an [`AudioClock`] as it is consumed.
pub struct Counted<S> {
    inner: S,
    samples: Arc<AtomicU64>,
}

impl<S> Iterator for Counted<S>
where
    S: Source,
    S::Item: Sample,
{
    type Item = S::Item;

    fn next(&mut self) -> Option<S::Item> {
        let sample = self.inner.next()?;
        self.samples.fetch_add(1, Ordering::Relaxed);
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> Source for Counted<S>
where
    S: Source,
    S::Item: Sample,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Default output device through rodio.
#[derive(Debug, Default)]
pub struct RodioOutput;

impl OutputBackend for RodioOutput {
    fn open(
        &self,
        config: &PlaybackConfig,
        completions: mpsc::UnboundedSender<ItemId>,
    ) -> VoiceResult<Box<dyn OutputSink>> {
        info!(
            "🔊 Initializing audio playback ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );
        Ok(Box::new(RodioSink::open(config, completions)?))
    }
}

/// A single rodio sink queue. Each item is appended behind the previous one and followed by a
/// completion callback; `stop()` on the sink is the kill-switch for interruption.
pub struct RodioSink {
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    clock: AudioClock,
    channels: u16,
    sample_rate: u32,
    /// Clock time at which everything queued on the current sink runs out.
    queued_until: f64,
    completions: mpsc::UnboundedSender<ItemId>,
    // Dropping this ends the thread that owns the (non-Send) output stream.
    _stream_guard: std_mpsc::Sender<()>,
}

impl RodioSink {
    pub fn open(
        config: &PlaybackConfig,
        completions: mpsc::UnboundedSender<ItemId>,
    ) -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (guard_tx, guard_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("ervie-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Blocks until the guard sender is dropped.
                    let _ = guard_rx.recv();
                    drop(stream);
                    debug!("Output stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;

        info!("✅ Audio playback initialized");
        Ok(Self {
            handle,
            sink: Some(sink),
            clock: AudioClock::new(config.sample_rate, config.channels),
            channels: config.channels,
            sample_rate: config.sample_rate,
            queued_until: 0.0,
            completions,
            _stream_guard: guard_tx,
        })
    }

    fn sink(&mut self) -> VoiceResult<&Sink> {
        if self.sink.is_none() {
            let sink =
                Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
            self.sink = Some(sink);
        }
        self.sink
            .as_ref()
            .ok_or_else(|| VoiceError::Playback("output sink unavailable".to_string()))
    }
}

impl OutputSink for RodioSink {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn play_at(&mut self, item: &PlaybackItem) -> VoiceResult<()> {
        let queue_end = self.queued_until.max(self.clock.now());
        let gap = item.start - queue_end;
        let frame = &item.frame;
        let clock = self.clock.clone();
        let (channels, sample_rate) = (self.channels, self.sample_rate);
        let tx = self.completions.clone();
        let id = item.id;
        let sink = self.sink()?;

        // Silence keeps the clock running up to a start that lies past the queue.
        if gap > 0.0 {
            let silence = Zero::<f32>::new(channels, sample_rate)
                .take_duration(Duration::from_secs_f64(gap));
            sink.append(clock.counted(silence));
        }
        let samples =
            SamplesBuffer::new(frame.channels(), frame.sample_rate(), frame.samples().to_vec());
        sink.append(clock.counted(samples));
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            let _ = tx.send(id);
        })));

        self.queued_until = item.end().max(queue_end);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.queued_until = self.clock.now();
        match Sink::try_new(&self.handle) {
            Ok(sink) => self.sink = Some(sink),
            Err(e) => warn!("Could not reopen the output queue: {}", e),
        }
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SimSink {
        clock: Arc<Mutex<f64>>,
        started: Arc<Mutex<Vec<ItemId>>>,
        stops: Arc<Mutex<usize>>,
        fail: bool,
    }

    impl SimSink {
        fn set_time(&self, t: f64) {
            *self.clock.lock().unwrap() = t;
        }
    }

    impl OutputSink for SimSink {
        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn play_at(&mut self, item: &PlaybackItem) -> VoiceResult<()> {
            if self.fail {
                return Err(VoiceError::Playback("device gone".into()));
            }
            self.started.lock().unwrap().push(item.id);
            Ok(())
        }

        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    /// `secs` of mono audio at 10 Hz.
    fn frame(secs: f64, seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0; (secs * 10.0).round() as usize], 10, 1, seq)
    }

    #[test]
    fn late_arrival_is_clamped_to_previous_end() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim.clone()));

        let first = scheduler.schedule(frame(0.5, 0)).unwrap();
        sim.set_time(0.3);
        let second = scheduler.schedule(frame(0.2, 1)).unwrap();

        assert!((first.start - 0.0).abs() < 1e-9);
        assert!((second.start - 0.5).abs() < 1e-9);
        assert!((scheduler.cursor() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn drained_queue_starts_at_now() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim.clone()));
        scheduler.schedule(frame(0.2, 0)).unwrap();
        sim.set_time(1.0);
        let item = scheduler.schedule(frame(0.2, 1)).unwrap();
        assert!((item.start - 1.0).abs() < 1e-9);
    }

    #[test]
    fn adjacent_items_never_overlap() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim.clone()));
        let arrivals = [(0.0, 0.4), (0.1, 0.3), (0.2, 0.1), (1.5, 0.2), (1.6, 0.5)];
        let mut items = Vec::new();
        for (i, (at, dur)) in arrivals.iter().enumerate() {
            sim.set_time(*at);
            items.push(scheduler.schedule(frame(*dur, i as u64)).unwrap());
        }
        for pair in items.windows(2) {
            assert!(pair[1].start >= pair[0].end() - 1e-9);
        }
        assert_eq!(*sim.started.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn completion_removes_item() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim.clone()));
        let a = scheduler.schedule(frame(0.1, 0)).unwrap();
        scheduler.schedule(frame(0.1, 1)).unwrap();
        assert!(scheduler.complete(a.id));
        assert!(!scheduler.complete(a.id));
        assert_eq!(scheduler.in_flight_len(), 1);
        assert_eq!(*sim.stops.lock().unwrap(), 0);
    }

    #[test]
    fn flush_stops_all_and_rewinds() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim.clone()));
        scheduler.schedule(frame(0.5, 0)).unwrap();
        scheduler.schedule(frame(0.5, 1)).unwrap();
        sim.set_time(0.2);

        assert_eq!(scheduler.flush(), 2);
        assert_eq!(scheduler.in_flight_len(), 0);
        assert!((scheduler.cursor() - 0.2).abs() < 1e-9);
        assert_eq!(*sim.stops.lock().unwrap(), 1);

        // Second flush is a no-op.
        assert_eq!(scheduler.flush(), 0);
        assert!((scheduler.cursor() - 0.2).abs() < 1e-9);
        assert_eq!(*sim.stops.lock().unwrap(), 1);

        let next = scheduler.schedule(frame(0.1, 2)).unwrap();
        assert!((next.start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn flush_when_idle_is_noop() {
        let sim = SimSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sim));
        assert_eq!(scheduler.flush(), 0);
        assert!(!scheduler.is_playing());
    }

    #[test]
    fn sink_failure_leaves_cursor_alone() {
        let sim = SimSink {
            fail: true,
            ..Default::default()
        };
        let mut scheduler = PlaybackScheduler::new(Box::new(sim));
        assert!(scheduler.schedule(frame(0.5, 0)).is_err());
        assert_eq!(scheduler.cursor(), 0.0);
        assert_eq!(scheduler.in_flight_len(), 0);
    }

    #[test]
    fn clock_follows_consumed_samples() {
        let clock = AudioClock::new(10, 2);
        assert_eq!(clock.now(), 0.0);

        // One second of stereo at 10 Hz is 20 interleaved samples.
        let mut source = clock.counted(SamplesBuffer::new(2, 10, vec![0i16; 20]));
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 10);

        for _ in 0..10 {
            source.next();
        }
        assert!((clock.now() - 0.5).abs() < 1e-9);

        // Queued but never pulled (a stopped queue) does not advance the clock.
        let _unplayed = clock.counted(SamplesBuffer::new(2, 10, vec![0i16; 20]));
        assert_eq!(source.count(), 10);
        assert!((clock.now() - 1.0).abs() < 1e-9);
    }
}
