//! Microphone capture: cpal input → mono at the capture rate → fixed-size frames.
//!
//! The device callback is the only producer. It hands finished frames to the session
//! through an unbounded channel and publishes the window level through an atomic, so
//! neither side ever waits on the other.

use crate::codec::{self, AudioFrame};
use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use futures::Stream as FuturesStream;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Latest input level (RMS of the most recent window, 0.0..=1.0). Lock-free.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Root-mean-square magnitude of a window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Average interleaved channels down to mono.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Input block size handed to the sinc resampler.
const RESAMPLE_CHUNK: usize = 1024;

/// Streaming mono rate converter.
///
/// Device callbacks deliver buffers of arbitrary length. Input is buffered into fixed
/// blocks and the filter keeps its phase from one block to the next, so the output length
/// tracks `input * to / from` over the life of the stream instead of rounding per buffer.
pub struct StreamResampler {
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> VoiceResult<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::Config(format!(
                "cannot resample {}Hz to {}Hz",
                from_rate, to_rate
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
            });
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to_rate as f64 / from_rate as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
            .map_err(|e| VoiceError::Config(format!("resampler setup failed: {}", e)))?;
        debug!("Resampling capture {}Hz -> {}Hz", from_rate, to_rate);

        Ok(Self {
            inner: Some(inner),
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
        })
    }

    /// Feed mono samples at the source rate; returns whatever output is ready.
    pub fn push(&mut self, mono: &[f32]) -> VoiceResult<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(mono.to_vec());
        };
        self.pending.extend_from_slice(mono);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            let resampled = resampler
                .process(&block, None)
                .map_err(|e| VoiceError::DeviceUnavailable(format!("resampling failed: {}", e)))?;
            if let Some(channel) = resampled.into_iter().next() {
                out.extend(channel);
            }
        }
        Ok(out)
    }

    /// Samples waiting for a full input block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Cuts a continuous mono sample stream into fixed-size, sequence-numbered frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_seq: u64,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_size),
            next_seq: 0,
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() >= self.frame_size {
                let pcm = codec::quantize(&self.pending);
                frames.push(AudioFrame::new(pcm, self.sample_rate, 1, self.next_seq));
                self.next_seq += 1;
                self.pending.clear();
            }
        }
        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// An open capture: an endless stream of frames until [`CaptureStream::close`].
///
/// The device is released exactly once, by `close` or on drop, whichever comes first.
pub struct CaptureStream {
    frames: mpsc::UnboundedReceiver<VoiceResult<AudioFrame>>,
    level: LevelMeter,
    release: Option<Release>,
}

impl CaptureStream {
    pub fn new(
        frames: mpsc::UnboundedReceiver<VoiceResult<AudioFrame>>,
        level: LevelMeter,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames,
            level,
            release: Some(Box::new(release)),
        }
    }

    pub fn level(&self) -> &LevelMeter {
        &self.level
    }

    pub fn is_open(&self) -> bool {
        self.release.is_some()
    }

    /// Release the device and analysis window. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            self.frames.close();
            self.level.reset();
            release();
            debug!("Capture released");
        }
    }
}

impl FuturesStream for CaptureStream {
    type Item = VoiceResult<AudioFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Acquires the microphone for one session.
///
/// `open` may block while the device comes up, so the engine calls it from the blocking pool.
pub trait CaptureBackend: Send + Sync {
    /// Fails with `DeviceUnavailable` if there is no device or access is denied. The pipeline
    /// publishes its window level into `level` until closed.
    fn open(&self, config: &CaptureConfig, level: LevelMeter) -> VoiceResult<CaptureStream>;
}

/// Default input device through cpal.
#[derive(Debug, Default)]
pub struct CpalCapture;

impl CpalCapture {
    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl CaptureBackend for CpalCapture {
    fn open(&self, config: &CaptureConfig, level: LevelMeter) -> VoiceResult<CaptureStream> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} samples per frame)",
            config.sample_rate, config.frame_size
        );

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let cfg = config.clone();
        let meter = level.clone();
        // cpal streams are !Send on some platforms, so the stream lives and dies on this thread.
        thread::Builder::new()
            .name("ervie-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&cfg, frame_tx, meter) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture stream dropped");
            })?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| VoiceError::DeviceUnavailable("capture thread exited".to_string()))??;
        info!("📱 Using input device: {}", device_name);

        // Release only signals the thread; it drops the stream on its own time.
        Ok(CaptureStream::new(frame_rx, level, move || {
            let _ = stop_tx.send(());
        }))
    }
}

/// State owned by the device callback.
struct CallbackState {
    assembler: FrameAssembler,
    frames: mpsc::UnboundedSender<VoiceResult<AudioFrame>>,
    level: LevelMeter,
    resampler: StreamResampler,
    native_channels: usize,
}

impl CallbackState {
    fn push(&mut self, data: &[f32]) {
        let mono = to_mono(data, self.native_channels);
        self.level.set(rms(&mono));
        let resampled = match self.resampler.push(&mono) {
            Ok(resampled) => resampled,
            Err(e) => {
                let _ = self.frames.send(Err(e));
                return;
            }
        };
        for frame in self.assembler.push(&resampled) {
            if self.frames.send(Ok(frame)).is_err() {
                // Session side is gone; close() will stop the stream shortly.
                return;
            }
        }
    }
}

fn build_input_stream(
    cfg: &CaptureConfig,
    frames: mpsc::UnboundedSender<VoiceResult<AudioFrame>>,
    level: LevelMeter,
) -> VoiceResult<(Stream, String)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device.default_input_config()?;
    debug!("Default input config: {:?}", supported);
    let stream_config: StreamConfig = supported.clone().into();

    let err_tx = frames.clone();
    let on_error = move |err: cpal::StreamError| {
        warn!("Audio stream error: {}", err);
        let _ = err_tx.send(Err(VoiceError::DeviceUnavailable(err.to_string())));
    };

    let mut state = CallbackState {
        assembler: FrameAssembler::new(cfg.frame_size, cfg.sample_rate),
        frames,
        level,
        resampler: StreamResampler::new(supported.sample_rate().0, cfg.sample_rate)?,
        native_channels: supported.channels() as usize,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| state.push(data),
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| state.push(&codec::to_f32(data)),
            on_error,
            None,
        )?,
        other => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "Unsupported sample format {:?} (need F32 or I16)",
                other
            )))
        }
    };

    stream.play()?;
    Ok((stream, name))
}
