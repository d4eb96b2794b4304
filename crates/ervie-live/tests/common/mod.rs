//! Scripted endpoint, fake microphone and simulated speakers for driving a real engine.

#![allow(dead_code)]

use async_trait::async_trait;
use ervie_live::{
    AudioFrame, CaptureBackend, CaptureConfig, CaptureStream, ConnectionState, DuplexChannel,
    DuplexConnector, EngineBackends, ItemId, LevelMeter, LiveConfig, MemoryHistory, OutputBackend,
    OutputSink, PlaybackConfig, PlaybackItem, RemoteEnd, ServerEvent, SessionSetup, VoiceEngine,
    VoiceError, VoiceResult,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `cond` until it holds or [`WAIT`] runs out.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_state(engine: &VoiceEngine, want: ConnectionState) {
    eventually(&format!("state {}", want), || engine.state() == want).await;
}

/// Hands each opened channel's endpoint side to the test.
pub struct ScriptedConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    pub setups: Mutex<Vec<SessionSetup>>,
    pub fail_with: Mutex<Option<String>>,
    pub hold: Mutex<Option<Duration>>,
}

#[async_trait]
impl DuplexConnector for ScriptedConnector {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<DuplexChannel> {
        self.setups.lock().unwrap().push(setup.clone());
        let hold = *self.hold.lock().unwrap();
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }
        let failure = self.fail_with.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(VoiceError::ConnectionFailed(message));
        }
        let (channel, remote) = DuplexChannel::in_memory();
        let _ = self.remotes.send(remote);
        Ok(channel)
    }
}

/// Fake microphone. Frames pushed here come out of the open capture stream.
#[derive(Clone, Default)]
pub struct FakeMic {
    pub opens: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
    /// How long `open` blocks before the device comes up, in milliseconds.
    pub open_delay_ms: Arc<AtomicU64>,
    frames: Arc<Mutex<Option<mpsc::UnboundedSender<VoiceResult<AudioFrame>>>>>,
}

impl FakeMic {
    pub fn slow_open(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn push(&self, frame: VoiceResult<AudioFrame>) -> bool {
        match self.frames.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

struct FakeMicBackend(FakeMic);

impl CaptureBackend for FakeMicBackend {
    fn open(&self, _config: &CaptureConfig, level: LevelMeter) -> VoiceResult<CaptureStream> {
        let delay = self.0.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            // Device bring-up blocks the calling thread, as cpal does.
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("microphone permission denied".into()));
        }
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.frames.lock().unwrap() = Some(tx);
        level.set(0.5);

        let mic = self.0.clone();
        Ok(CaptureStream::new(rx, level, move || {
            mic.releases.fetch_add(1, Ordering::SeqCst);
            mic.frames.lock().unwrap().take();
        }))
    }
}

/// Simulated speakers with a settable clock.
#[derive(Clone, Default)]
pub struct FakeSpeakers {
    clock: Arc<Mutex<f64>>,
    started: Arc<Mutex<Vec<PlaybackItem>>>,
    playing: Arc<Mutex<Vec<ItemId>>>,
    stopped: Arc<Mutex<Vec<ItemId>>>,
    completions: Arc<Mutex<Option<mpsc::UnboundedSender<ItemId>>>>,
}

impl FakeSpeakers {
    pub fn set_time(&self, t: f64) {
        *self.clock.lock().unwrap() = t;
    }

    pub fn started(&self) -> Vec<PlaybackItem> {
        self.started.lock().unwrap().clone()
    }

    /// Items that were cut off by a stop, in start order.
    pub fn stopped(&self) -> Vec<ItemId> {
        self.stopped.lock().unwrap().clone()
    }

    /// Items queued and neither finished nor stopped.
    pub fn playing(&self) -> Vec<ItemId> {
        self.playing.lock().unwrap().clone()
    }

    /// Report `id` as played to the end.
    pub fn finish(&self, id: ItemId) {
        self.playing.lock().unwrap().retain(|p| *p != id);
        if let Some(tx) = self.completions.lock().unwrap().as_ref() {
            let _ = tx.send(id);
        }
    }
}

struct FakeSpeakersBackend(FakeSpeakers);

impl OutputBackend for FakeSpeakersBackend {
    fn open(
        &self,
        _config: &PlaybackConfig,
        completions: mpsc::UnboundedSender<ItemId>,
    ) -> VoiceResult<Box<dyn OutputSink>> {
        *self.0.completions.lock().unwrap() = Some(completions);
        Ok(Box::new(FakeSpeakersSink(self.0.clone())))
    }
}

struct FakeSpeakersSink(FakeSpeakers);

impl OutputSink for FakeSpeakersSink {
    fn now(&self) -> f64 {
        *self.0.clock.lock().unwrap()
    }

    fn play_at(&mut self, item: &PlaybackItem) -> VoiceResult<()> {
        self.0.started.lock().unwrap().push(item.clone());
        self.0.playing.lock().unwrap().push(item.id);
        Ok(())
    }

    fn stop(&mut self) {
        let cut: Vec<ItemId> = self.0.playing.lock().unwrap().drain(..).collect();
        self.0.stopped.lock().unwrap().extend(cut);
    }
}

/// A running engine wired to the fakes above.
pub struct Harness {
    pub engine: VoiceEngine,
    pub history: MemoryHistory,
    pub connector: Arc<ScriptedConnector>,
    pub remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    pub capture: FakeMic,
    pub output: FakeSpeakers,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let (remote_tx, remotes) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector {
            remotes: remote_tx,
            setups: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            hold: Mutex::new(None),
        });
        let history = MemoryHistory::new();
        let capture = FakeMic::default();
        let output = FakeSpeakers::default();

        let backends = EngineBackends {
            connector: connector.clone(),
            capture: Arc::new(FakeMicBackend(capture.clone())),
            output: Arc::new(FakeSpeakersBackend(output.clone())),
            history: Arc::new(history.clone()),
        };
        let engine = VoiceEngine::spawn(LiveConfig::default(), backends);

        Self {
            engine,
            history,
            connector,
            remotes,
            capture,
            output,
        }
    }

    pub async fn next_remote(&mut self) -> RemoteEnd {
        timeout(WAIT, self.remotes.recv())
            .await
            .expect("connector was never called")
            .expect("connector dropped")
    }

    /// Start, connect and open a session; returns the endpoint side.
    pub async fn open_session(&mut self) -> RemoteEnd {
        timeout(WAIT, self.engine.start())
            .await
            .expect("start timed out")
            .expect("start failed");
        let remote = self.next_remote().await;
        assert!(remote.emit(ServerEvent::Opened));
        wait_for_state(&self.engine, ConnectionState::Active).await;
        remote
    }
}

/// Base64 PCM for `samples` samples of a quiet tone.
pub fn audio_chunk(samples: usize) -> ServerEvent {
    let pcm = ervie_live::codec::encode(&vec![0.1; samples]);
    ServerEvent::AudioChunk {
        data: ervie_live::codec::to_base64(&pcm),
    }
}
