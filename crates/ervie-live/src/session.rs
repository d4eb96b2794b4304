//! Live session state machine.
//!
//! One engine task owns everything mutable: the capture stream, the playback scheduler, the
//! duplex channel and the transcript. Device callbacks, socket readers, device setup and the
//! connect attempt only ever post into the queues that task selects over, so every state
//! transition happens in one place. The [`VoiceEngine`] handle talks to it with commands and observes it through
//! watch channels.

use crate::capture::{CaptureBackend, CaptureStream, CpalCapture, LevelMeter};
use crate::channel::{DuplexChannel, DuplexConnector, WebSocketConnector};
use crate::codec::{self, AudioFrame};
use crate::config::{CaptureConfig, LiveConfig, PlaybackConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::history::HistoryStore;
use crate::playback::{ItemId, OutputBackend, OutputSink, PlaybackScheduler, RodioOutput};
use crate::protocol::{ClientMessage, Role, ServerEvent};
use crate::transcript::{TranscriptAccumulator, TranscriptEntry};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the live session.
///
/// ```text
/// Idle ──start──▶ Connecting ──opened──▶ Active ──stop / remote close──▶ Closing ──▶ Closed
///                     │                    │
///                     └──── failure ───────┴──────────────▶ Closing ──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// True while a session holds devices or a channel.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The collaborators an engine runs against.
pub struct EngineBackends {
    pub connector: Arc<dyn DuplexConnector>,
    pub capture: Arc<dyn CaptureBackend>,
    pub output: Arc<dyn OutputBackend>,
    pub history: Arc<dyn HistoryStore>,
}

impl EngineBackends {
    /// Default microphone, default speakers and the configured live endpoint.
    pub fn live(config: &LiveConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            connector: Arc::new(WebSocketConnector::new(
                config.endpoint.clone(),
                config.api_key.clone(),
            )),
            capture: Arc::new(CpalCapture),
            output: Arc::new(RodioOutput),
            history,
        }
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
}

/// Devices opened for one start attempt.
struct Devices {
    sink: Box<dyn OutputSink>,
    completions: mpsc::UnboundedReceiver<ItemId>,
    capture: CaptureStream,
}

enum Internal {
    Acquired {
        epoch: u64,
        result: VoiceResult<Devices>,
    },
    Connected {
        epoch: u64,
        result: VoiceResult<DuplexChannel>,
    },
}

enum Event {
    Command(Option<Command>),
    Internal(Internal),
    Inbound(Option<ServerEvent>),
    Captured(Option<VoiceResult<AudioFrame>>),
    PlaybackDone(ItemId),
}

/// Resources held by one session. Dropping it releases all of them.
struct Session {
    /// Which start attempt this is; late connect results for older attempts are discarded.
    epoch: u64,
    channel: Option<DuplexChannel>,
    inbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    capture: CaptureStream,
    scheduler: PlaybackScheduler,
    completions: mpsc::UnboundedReceiver<ItemId>,
    audio_seq: u64,
}

struct EngineLoop {
    config: LiveConfig,
    backends: EngineBackends,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state: ConnectionState,
    session: Option<Session>,
    /// Reply for the start in progress, until the connect attempt settles.
    pending_start: Option<oneshot::Sender<VoiceResult<()>>>,
    transcript: TranscriptAccumulator,
    level: LevelMeter,
    epoch: u64,
    state_tx: watch::Sender<ConnectionState>,
    transcript_tx: watch::Sender<Vec<TranscriptEntry>>,
    error_tx: watch::Sender<Option<String>>,
}

async fn recv_opt<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Open the speakers, then the microphone. Runs on the blocking pool.
fn acquire_devices(
    output: &dyn OutputBackend,
    capture: &dyn CaptureBackend,
    playback: &PlaybackConfig,
    capture_config: &CaptureConfig,
    level: LevelMeter,
) -> VoiceResult<Devices> {
    let (done_tx, completions) = mpsc::unbounded_channel();
    let sink = output.open(playback, done_tx)?;
    // On failure the sink drops here and releases the output device.
    let capture = capture.open(capture_config, level)?;
    Ok(Devices {
        sink,
        completions,
        capture,
    })
}

/// Events that only mean something once the session is open.
fn needs_active(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::AudioChunk { .. }
            | ServerEvent::Transcription { .. }
            | ServerEvent::Interrupted
            | ServerEvent::TurnComplete
    )
}

impl EngineLoop {
    async fn run(mut self) {
        info!("🎭 Voice engine ready");
        loop {
            match self.next_event().await {
                Event::Command(Some(cmd)) => self.handle_command(cmd),
                Event::Command(None) => {
                    self.teardown(ConnectionState::Closed);
                    break;
                }
                Event::Internal(Internal::Acquired { epoch, result }) => {
                    self.on_acquired(epoch, result)
                }
                Event::Internal(Internal::Connected { epoch, result }) => {
                    self.on_connected(epoch, result)
                }
                Event::Inbound(event) => self.on_server_event(event),
                Event::Captured(frame) => self.on_captured(frame),
                Event::PlaybackDone(id) => {
                    if let Some(session) = self.session.as_mut() {
                        session.scheduler.complete(id);
                    }
                }
            }
        }
        debug!("Voice engine loop finished");
    }

    async fn next_event(&mut self) -> Event {
        let commands = &mut self.commands;
        let internal = &mut self.internal_rx;
        match self.session.as_mut() {
            None => tokio::select! {
                cmd = commands.recv() => Event::Command(cmd),
                Some(msg) = internal.recv() => Event::Internal(msg),
            },
            Some(session) => {
                let Session {
                    inbound,
                    capture,
                    completions,
                    ..
                } = session;
                tokio::select! {
                    cmd = commands.recv() => Event::Command(cmd),
                    Some(msg) = internal.recv() => Event::Internal(msg),
                    event = recv_opt(inbound.as_mut()) => Event::Inbound(event),
                    frame = capture.next() => Event::Captured(frame),
                    Some(id) = completions.recv() => Event::PlaybackDone(id),
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => self.start(reply),
            Command::Stop { reply } => {
                info!("Stopping voice session (was {})", self.state);
                self.teardown(ConnectionState::Closed);
                let _ = reply.send(());
            }
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(text));
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<VoiceResult<()>>) {
        if self.state.is_live() {
            info!("Closing the previous session before starting a new one");
            self.teardown(ConnectionState::Closed);
        }

        self.epoch += 1;
        self.set_error(None);
        self.set_state(ConnectionState::Connecting);
        info!("🚀 Starting live session #{}", self.epoch);

        if let Err(e) = self.config.validate() {
            return self.fail_start(reply, e);
        }
        self.pending_start = Some(reply);

        let output = Arc::clone(&self.backends.output);
        let capture = Arc::clone(&self.backends.capture);
        let playback_config = self.config.playback.clone();
        let capture_config = self.config.capture.clone();
        let level = self.level.clone();
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let opened = tokio::task::spawn_blocking(move || {
                acquire_devices(
                    output.as_ref(),
                    capture.as_ref(),
                    &playback_config,
                    &capture_config,
                    level,
                )
            })
            .await;
            let result = opened.unwrap_or_else(|e| {
                Err(VoiceError::DeviceUnavailable(format!(
                    "device setup task failed: {}",
                    e
                )))
            });
            let _ = internal.send(Internal::Acquired { epoch, result });
        });
    }

    fn fail_start(&mut self, reply: oneshot::Sender<VoiceResult<()>>, err: VoiceError) {
        error!("❌ Failed to start live session: {}", err);
        self.set_error(Some(err.to_string()));
        self.level.reset();
        self.set_state(ConnectionState::Failed);
        let _ = reply.send(Err(err));
    }

    fn on_acquired(&mut self, epoch: u64, result: VoiceResult<Devices>) {
        let current = epoch == self.epoch
            && self.session.is_none()
            && self.pending_start.is_some()
            && self.state == ConnectionState::Connecting;
        if !current {
            // Dropping late devices releases them.
            debug!("Releasing devices for superseded attempt #{}", epoch);
            return;
        }

        let devices = match result {
            Ok(devices) => devices,
            Err(e) => {
                if let Some(reply) = self.pending_start.take() {
                    self.fail_start(reply, e);
                }
                return;
            }
        };

        self.transcript.clear_view();
        self.publish_transcript();

        self.session = Some(Session {
            epoch,
            channel: None,
            inbound: None,
            capture: devices.capture,
            scheduler: PlaybackScheduler::new(devices.sink),
            completions: devices.completions,
            audio_seq: 0,
        });

        let connector = Arc::clone(&self.backends.connector);
        let setup = self.config.session_setup();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&setup).await;
            let _ = internal.send(Internal::Connected { epoch, result });
        });
    }

    fn on_connected(&mut self, epoch: u64, result: VoiceResult<DuplexChannel>) {
        let session = match self.session.as_mut() {
            Some(session) if session.epoch == epoch => session,
            // Dropping a late channel closes it.
            _ => {
                debug!("Discarding connect result for superseded attempt #{}", epoch);
                return;
            }
        };

        match result {
            Ok(mut channel) => {
                session.inbound = channel.take_inbound();
                session.channel = Some(channel);
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(()));
                }
                info!("🔗 Live channel connected, waiting for the session to open");
            }
            Err(e) => {
                let reply = self.pending_start.take();
                error!("❌ Live channel connect failed: {}", e);
                self.set_error(Some(e.to_string()));
                self.teardown(ConnectionState::Failed);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn on_server_event(&mut self, event: Option<ServerEvent>) {
        let event = event.unwrap_or(ServerEvent::Closed { reason: None });

        if needs_active(&event) && self.state != ConnectionState::Active {
            debug!("Ignoring {:?} while {}", event, self.state);
            return;
        }

        match event {
            ServerEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    debug!("Duplicate open signal while {}", self.state);
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    session.scheduler.flush();
                }
                self.set_state(ConnectionState::Active);
                info!("🎙️ Live session active");
            }
            ServerEvent::AudioChunk { data } => self.on_audio_chunk(&data),
            ServerEvent::Transcription {
                direction,
                seq,
                delta,
            } => {
                if let Err(e) = self.transcript.append(direction, seq, &delta) {
                    self.report(e);
                }
                self.publish_transcript();
            }
            ServerEvent::Interrupted => {
                let stopped = self
                    .session
                    .as_mut()
                    .map(|s| s.scheduler.flush())
                    .unwrap_or(0);
                self.transcript.discard_outbound();
                self.publish_transcript();
                info!("✋ Barge-in: stopped {} playback item(s)", stopped);
            }
            ServerEvent::TurnComplete => {
                self.transcript.commit_turn();
                self.publish_transcript();
            }
            ServerEvent::Undecodable { detail } => {
                self.report(VoiceError::MalformedFrame(detail));
            }
            ServerEvent::Closed { reason } => {
                match reason {
                    Some(reason) => info!("Live channel closed by the endpoint: {}", reason),
                    None => info!("Live channel closed"),
                }
                self.teardown(ConnectionState::Closed);
            }
            ServerEvent::Error { message } => {
                self.fail(VoiceError::ChannelError(message));
            }
        }
    }

    fn on_audio_chunk(&mut self, data: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let playback = &self.config.playback;
        let seq = session.audio_seq;
        session.audio_seq += 1;

        let result = codec::decode_base64(data, playback.sample_rate, playback.channels, seq)
            .and_then(|frame| session.scheduler.schedule(frame));
        match result {
            Err(e) if e.is_fatal() => self.fail(e),
            Err(e) => self.report(e),
            Ok(_) => {}
        }
    }

    fn on_captured(&mut self, frame: Option<VoiceResult<AudioFrame>>) {
        match frame {
            Some(Ok(frame)) => {
                if self.state != ConnectionState::Active {
                    return;
                }
                let Some(channel) = self.session.as_ref().and_then(|s| s.channel.as_ref()) else {
                    return;
                };
                let msg = ClientMessage::AudioFrame {
                    bytes: frame.to_bytes(),
                    sample_rate: frame.sample_rate(),
                };
                if let Err(e) = channel.send(msg) {
                    self.fail(e);
                }
            }
            Some(Err(e)) => self.fail(e),
            None => self.fail(VoiceError::DeviceUnavailable(
                "capture stream ended".to_string(),
            )),
        }
    }

    fn send_text(&mut self, text: String) -> VoiceResult<()> {
        if self.state != ConnectionState::Active {
            return Err(VoiceError::NotConnected);
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        let channel = self
            .session
            .as_ref()
            .and_then(|s| s.channel.as_ref())
            .ok_or(VoiceError::NotConnected)?;

        let turn = ClientMessage::TextTurn {
            role: Role::User,
            text: text.clone(),
            complete: true,
        };
        if let Err(e) = channel.send(turn) {
            let message = e.to_string();
            self.fail(e);
            return Err(VoiceError::ChannelError(message));
        }

        self.transcript.record_text_turn(text.trim());
        self.publish_transcript();
        Ok(())
    }

    /// Record a contained error. The session keeps running.
    fn report(&mut self, err: VoiceError) {
        warn!("⚠️ {}", err);
        self.set_error(Some(err.to_string()));
    }

    /// Record a fatal error and tear the session down.
    fn fail(&mut self, err: VoiceError) {
        error!("❌ Live session failed: {}", err);
        self.set_error(Some(err.to_string()));
        self.teardown(ConnectionState::Failed);
    }

    /// Release everything the session holds and settle in `terminal`. Safe in any state.
    fn teardown(&mut self, terminal: ConnectionState) {
        let live = self.session.is_some() || self.pending_start.is_some();
        if live {
            self.set_state(ConnectionState::Closing);
        }
        if let Some(mut session) = self.session.take() {
            session.capture.close();
            let stopped = session.scheduler.flush();
            if let Some(mut channel) = session.channel.take() {
                channel.close();
            }
            info!(
                "🛑 Live session #{} released ({} playback item(s) stopped)",
                session.epoch, stopped
            );
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(VoiceError::ConnectionFailed(
                "session closed before the channel connected".to_string(),
            )));
        }
        if live {
            self.transcript.reset();
        }
        self.level.reset();
        self.set_state(terminal);
        self.publish_transcript();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Session state {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn set_error(&self, err: Option<String>) {
        self.error_tx.send_replace(err);
    }

    fn publish_transcript(&self) {
        self.transcript_tx.send_replace(self.transcript.entries());
    }
}

fn engine_gone() -> VoiceError {
    VoiceError::ChannelError("voice engine has shut down".to_string())
}

/// Handle to a running voice engine. Cheap observers, async commands.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the engine and
/// releases any open session.
pub struct VoiceEngine {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    transcript: watch::Receiver<Vec<TranscriptEntry>>,
    last_error: watch::Receiver<Option<String>>,
    level: LevelMeter,
    task: JoinHandle<()>,
}

impl VoiceEngine {
    pub fn spawn(config: LiveConfig, backends: EngineBackends) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (transcript_tx, transcript) = watch::channel(Vec::new());
        let (error_tx, last_error) = watch::channel(None);
        let level = LevelMeter::new();

        let engine = EngineLoop {
            transcript: TranscriptAccumulator::new(Arc::clone(&backends.history)),
            config,
            backends,
            commands: command_rx,
            internal_tx,
            internal_rx,
            state: ConnectionState::Idle,
            session: None,
            pending_start: None,
            level: level.clone(),
            epoch: 0,
            state_tx,
            transcript_tx,
            error_tx,
        };
        let task = tokio::spawn(engine.run());

        Self {
            commands,
            state,
            transcript,
            last_error,
            level,
            task,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    /// Acquire devices and connect. Device setup runs off the engine task, so observers and
    /// `stop()` stay responsive meanwhile. Resolves once the connect attempt settles; the state
    /// moves on to `Active` when the endpoint confirms the session.
    pub async fn start(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Release everything and end in `Closed`. Never fails.
    pub async fn stop(&self) {
        if self.request(|reply| Command::Stop { reply }).await.is_err() {
            debug!("Stop requested after the engine shut down");
        }
    }

    /// Send a typed turn. Fails with `NotConnected` unless the session is `Active`.
    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current input level, 0.0 when no capture is running.
    pub fn level(&self) -> f32 {
        self.level.get()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.borrow().clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.transcript.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    /// Stop the engine task and wait for it to release everything.
    pub async fn shutdown(self) {
        let VoiceEngine { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            warn!("Voice engine task ended abnormally: {}", e);
        }
    }
}
