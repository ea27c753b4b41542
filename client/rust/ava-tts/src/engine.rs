//! Session engine over the bidirectional TTS websocket.
//!
//! One connection carries many sessions, one at a time. Each session gets a
//! fresh [`Streamer`]; the inbound task appends audio and timing to it while
//! callers drive the session lifecycle and wait on single-shot acks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, TtsError};
use crate::protocol::{
    self, AudioParams, EMPTY_PAYLOAD, EventType, Message, MsgType, Request, speech_rate,
};
use crate::streamer::Streamer;
use crate::timing::{self, SentenceTiming};
use crate::ws::{EventHandler, FrameKind, WsClient};

/// Per-utterance hints sent with start-session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionHints {
    pub emotion: Option<String>,
    pub context_texts: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Finishing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
}

/// A streaming synthesis backend.
pub trait Engine: Send + Sync + 'static {
    /// Opens a session and returns the buffer its audio will land in.
    fn start(&self, hints: SessionHints) -> impl Future<Output = Result<Arc<Streamer>>> + Send;

    /// Queues text for the active session. Does not wait for audio.
    fn synthesize(&self, text: &str) -> impl Future<Output = Result<()>> + Send;

    /// Finishes the active session; a no-op without one.
    fn end(&self) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> Result<()>;

    /// Sentence timings received for the current or last session.
    fn word_timestamps(&self) -> Vec<SentenceTiming>;

    fn session_state(&self) -> SessionState;

    fn sample_rate(&self) -> u32;
}

type Waiter = oneshot::Sender<Result<()>>;

struct EngineState {
    connection: ConnectionState,
    connect_waiter: Option<Waiter>,
    session: SessionState,
    session_id: Option<String>,
    streamer: Option<Arc<Streamer>>,
    timings: Vec<SentenceTiming>,
    start_waiter: Option<Waiter>,
    finish_waiter: Option<Waiter>,
}

impl EngineState {
    /// Frames without a session id belong to whatever session is active.
    fn is_current(&self, session_id: &str) -> bool {
        session_id.is_empty() || self.session_id.as_deref() == Some(session_id)
    }

    fn reset_session(&mut self) -> Option<Arc<Streamer>> {
        self.session = SessionState::Idle;
        self.session_id = None;
        self.streamer.take()
    }
}

/// State reachable from the transport callbacks.
struct Shared {
    state: Mutex<EngineState>,
}

impl Shared {
    fn new() -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Self {
            state: Mutex::new(EngineState {
                connection: ConnectionState::Connecting,
                connect_waiter: Some(tx),
                session: SessionState::Idle,
                session_id: None,
                streamer: None,
                timings: Vec::new(),
                start_waiter: None,
                finish_waiter: None,
            }),
        });
        (shared, rx)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, msg: Message) {
        debug!(frame = %msg, "received frame");

        match msg.msg_type {
            MsgType::Error => {
                error!(
                    code = msg.error_code,
                    payload = %msg.payload_text(),
                    "provider error frame"
                );
                return;
            }
            MsgType::AudioOnlyServer => {
                self.on_audio(&msg);
                return;
            }
            _ => {}
        }

        match msg.event {
            EventType::ConnectionStarted => {
                info!(connect_id = %msg.connect_id, "tts connection started");
                self.resolve_connection(Ok(()));
            }
            EventType::ConnectionFailed => {
                let reason = msg.payload_text().into_owned();
                error!(connect_id = %msg.connect_id, %reason, "tts connection failed");
                self.resolve_connection(Err(TtsError::ConnectionFailed(reason)));
            }
            EventType::ConnectionFinished => {
                info!(connect_id = %msg.connect_id, "tts connection finished");
            }
            EventType::SessionStarted => self.on_session_started(&msg),
            EventType::SessionFailed => self.on_session_failed(&msg),
            EventType::SessionFinished | EventType::SessionCanceled => {
                self.on_session_finished(&msg)
            }
            EventType::TtsSentenceEnd if msg.msg_type == MsgType::FullServerResponse => {
                self.on_sentence_end(&msg)
            }
            EventType::TtsSentenceStart
            | EventType::TtsResponse
            | EventType::TtsEnded
            | EventType::UsageResponse => {
                trace!(event = ?msg.event, payload = %msg.payload_text(), "informational frame");
            }
            other => debug!(event = ?other, "dropping unhandled frame"),
        }
    }

    fn resolve_connection(&self, outcome: Result<()>) {
        let mut st = self.lock();
        st.connection = if outcome.is_ok() {
            ConnectionState::Ready
        } else {
            ConnectionState::Closed
        };
        if let Some(waiter) = st.connect_waiter.take() {
            let _ = waiter.send(outcome);
        }
    }

    fn on_audio(&self, msg: &Message) {
        let st = self.lock();
        if !st.is_current(&msg.session_id) {
            trace!(session_id = %msg.session_id, bytes = msg.payload.len(), "dropping stale audio");
            return;
        }
        match &st.streamer {
            Some(streamer) => streamer.append_audio(&msg.payload),
            None => trace!(bytes = msg.payload.len(), "audio without a session"),
        }
    }

    fn on_sentence_end(&self, msg: &Message) {
        let sentence = match SentenceTiming::from_payload(&msg.payload) {
            Ok(sentence) => sentence,
            Err(e) => {
                warn!(error = %e, "unparseable sentence timing");
                return;
            }
        };

        let mut guard = self.lock();
        let st = &mut *guard;
        if !st.is_current(&msg.session_id) {
            return;
        }
        debug!(text = %sentence.text, words = sentence.words.len(), "sentence finished");
        st.timings.push(sentence);
        if let Some(streamer) = &st.streamer {
            streamer.set_timings(&st.timings);
            if let Some(total) = timing::total_duration(&st.timings) {
                streamer.set_total_duration(total);
            }
        }
    }

    fn on_session_started(&self, msg: &Message) {
        let mut st = self.lock();
        if !st.is_current(&msg.session_id) || st.session != SessionState::Starting {
            debug!(session_id = %msg.session_id, "ignoring stale session-started");
            return;
        }
        st.session = SessionState::Active;
        if let Some(waiter) = st.start_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_session_failed(&self, msg: &Message) {
        let reason = msg.payload_text().into_owned();
        error!(session_id = %msg.session_id, %reason, "tts session failed");

        let mut st = self.lock();
        if !st.is_current(&msg.session_id) {
            return;
        }
        if let Some(streamer) = st.reset_session() {
            streamer.close();
        }
        for waiter in [st.start_waiter.take(), st.finish_waiter.take()]
            .into_iter()
            .flatten()
        {
            let _ = waiter.send(Err(TtsError::SessionFailed(reason.clone())));
        }
    }

    fn on_session_finished(&self, msg: &Message) {
        let mut st = self.lock();
        if !st.is_current(&msg.session_id) {
            debug!(session_id = %msg.session_id, "ignoring stale session-finished");
            return;
        }
        debug!(session_id = %msg.session_id, event = ?msg.event, "session over");
        if let Some(streamer) = st.reset_session() {
            streamer.close();
        }
        if let Some(waiter) = st.finish_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }
}

impl EventHandler for Shared {
    fn on_open(&self, client: &WsClient) {
        match protocol::encode(&Message::client_event(
            EventType::StartConnection,
            EMPTY_PAYLOAD,
        )) {
            Ok(bytes) => client.send_binary(bytes),
            Err(e) => warn!(error = %e, "failed to encode start-connection"),
        }
    }

    fn on_message(&self, _client: &WsClient, kind: FrameKind, data: &[u8]) {
        match protocol::decode(data) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => warn!(error = %e, ?kind, bytes = data.len(), "dropping undecodable frame"),
        }
    }

    fn on_error(&self, _client: &WsClient, error: &TtsError) {
        warn!(error = %error, "tts transport error");
    }

    fn on_close(&self, _client: &WsClient) {
        let mut st = self.lock();
        st.connection = ConnectionState::Closed;
        if let Some(streamer) = st.reset_session() {
            streamer.close();
        }
        if let Some(waiter) = st.connect_waiter.take() {
            let _ = waiter.send(Err(TtsError::ConnectionFailed(
                "connection closed before connection-started".to_string(),
            )));
        }
        for waiter in [st.start_waiter.take(), st.finish_waiter.take()]
            .into_iter()
            .flatten()
        {
            let _ = waiter.send(Err(TtsError::Closed));
        }
        info!("tts transport closed");
    }
}

fn handshake_headers(config: &EngineConfig, connect_id: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let pairs = [
        ("x-api-app-key", config.app_key.as_str()),
        ("x-api-access-key", config.access_key.as_str()),
        ("x-api-resource-id", config.resource_id.as_str()),
        ("x-api-connect-id", connect_id),
        ("x-control-require-usage-tokens-return", "*"),
    ];
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|e| TtsError::Config(format!("invalid value for header {name}: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

/// [`Engine`] backed by the Volcengine bidirectional TTS API.
pub struct VolcEngine {
    config: EngineConfig,
    connect_id: String,
    client: WsClient,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl VolcEngine {
    /// Dials the configured endpoint and waits for connection-started.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let connect_id = Uuid::new_v4().to_string();
        let headers = handshake_headers(&config, &connect_id)?;
        let (shared, ready) = Shared::new();

        info!(
            endpoint = %config.endpoint,
            resource_id = %config.resource_id,
            connect_id = %connect_id,
            "connecting to tts provider"
        );
        let client = WsClient::connect(&config.endpoint, headers, shared.clone()).await?;
        Self::await_ready(config, connect_id, client, shared, ready).await
    }

    /// Runs the engine over an already upgraded websocket.
    pub async fn with_stream<S>(ws_stream: WebSocketStream<S>, config: EngineConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;
        let (shared, ready) = Shared::new();
        let client = WsClient::start(ws_stream, shared.clone());
        Self::await_ready(config, Uuid::new_v4().to_string(), client, shared, ready).await
    }

    async fn await_ready(
        config: EngineConfig,
        connect_id: String,
        client: WsClient,
        shared: Arc<Shared>,
        ready: oneshot::Receiver<Result<()>>,
    ) -> Result<Self> {
        let waited = config.timeouts.connect();
        let outcome = match timeout(waited, ready).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TtsError::ConnectionFailed(
                "transport dropped before connection-started".to_string(),
            )),
            Err(_) => Err(TtsError::ConnectionStartTimeout(waited)),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "tts connection not established");
            client.close();
            return Err(e);
        }

        Ok(Self {
            config,
            connect_id,
            client,
            shared,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.client.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TtsError::Closed);
        }
        Ok(())
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let bytes = protocol::encode(msg)?;
        self.client.send_binary(bytes);
        Ok(())
    }

    fn send_finish_session(&self, session_id: &str) -> Result<()> {
        self.send(
            &Message::client_event(EventType::FinishSession, EMPTY_PAYLOAD)
                .with_session(session_id),
        )
    }

    fn start_session_request(&self, hints: &SessionHints) -> Result<Request> {
        let audio = &self.config.audio;
        Request::start_session(
            &self.config.voice_type,
            AudioParams {
                format: audio.encoding.clone(),
                sample_rate: audio.sample_rate,
                speech_rate: speech_rate(audio.speed_ratio),
                emotion: hints.emotion.clone().filter(|e| !e.is_empty()),
                enable_timestamp: true,
            },
            &hints.context_texts,
        )
    }

    /// Drops a session that never became active.
    fn abandon(&self, session_id: &str) {
        let mut st = self.shared.lock();
        if st.session_id.as_deref() != Some(session_id) {
            return;
        }
        st.start_waiter = None;
        if let Some(streamer) = st.reset_session() {
            streamer.close();
        }
    }

    /// Returns to idle after a finish attempt, acknowledged or not.
    fn finish_local(&self, session_id: &str) {
        let mut st = self.shared.lock();
        if st.session_id.as_deref() != Some(session_id) {
            return;
        }
        st.finish_waiter = None;
        if let Some(streamer) = st.reset_session() {
            streamer.close();
        }
    }
}

impl Engine for VolcEngine {
    async fn start(&self, hints: SessionHints) -> Result<Arc<Streamer>> {
        self.ensure_open()?;
        let session_id = Uuid::new_v4().to_string();
        let payload = self.start_session_request(&hints)?.to_json()?;
        let streamer = Arc::new(Streamer::new(
            self.config.audio.sample_rate,
            self.config.audio.channels,
        ));
        let (tx, rx) = oneshot::channel();

        let superseded = {
            let mut st = self.shared.lock();
            let previous = st.session_id.take();
            let superseded = match st.session {
                SessionState::Starting | SessionState::Active => previous,
                SessionState::Idle | SessionState::Finishing => None,
            };
            // The old buffer keeps whatever it already holds and drains.
            if let Some(previous) = st.streamer.replace(Arc::clone(&streamer)) {
                previous.close();
            }
            st.session = SessionState::Starting;
            st.session_id = Some(session_id.clone());
            st.timings.clear();
            st.start_waiter = Some(tx);
            st.finish_waiter = None;
            superseded
        };

        if let Some(previous) = superseded {
            debug!(session_id = %previous, "finishing superseded session");
            self.send_finish_session(&previous)?;
        }
        self.send(
            &Message::client_event(EventType::StartSession, payload).with_session(&session_id),
        )?;
        debug!(session_id = %session_id, emotion = ?hints.emotion, "session starting");

        let waited = self.config.timeouts.session_start();
        match timeout(waited, rx).await {
            Ok(Ok(Ok(()))) => {
                info!(session_id = %session_id, "tts session started");
                Ok(streamer)
            }
            Ok(Ok(Err(e))) => {
                self.abandon(&session_id);
                Err(e)
            }
            Ok(Err(_)) => Err(TtsError::SessionFailed(
                "superseded by a newer session".to_string(),
            )),
            Err(_) => {
                warn!(session_id = %session_id, ?waited, "session-started did not arrive");
                self.abandon(&session_id);
                if !self.is_closed() {
                    let _ = self.send_finish_session(&session_id);
                }
                Err(TtsError::SessionStartTimeout(waited))
            }
        }
    }

    async fn synthesize(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let session_id = {
            let st = self.shared.lock();
            match (st.session, &st.session_id) {
                (SessionState::Active, Some(id)) => id.clone(),
                _ => return Err(TtsError::NoActiveSession),
            }
        };
        let payload = Request::task(text).to_json()?;
        trace!(session_id = %session_id, chars = text.chars().count(), "task request");
        self.send(&Message::client_event(EventType::TaskRequest, payload).with_session(session_id))
    }

    async fn end(&self) -> Result<()> {
        let (session_id, rx) = {
            let mut st = self.shared.lock();
            let Some(session_id) = st.session_id.clone() else {
                return Ok(());
            };
            if st.session == SessionState::Finishing {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            st.finish_waiter = Some(tx);
            st.session = SessionState::Finishing;
            (session_id, rx)
        };

        if let Err(e) = self.send_finish_session(&session_id) {
            self.finish_local(&session_id);
            return Err(e);
        }

        let waited = self.config.timeouts.session_finish();
        let outcome = timeout(waited, rx).await;
        self.finish_local(&session_id);
        match outcome {
            Ok(Ok(Ok(()))) => {
                info!(session_id = %session_id, "tts session finished");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => {
                debug!(session_id = %session_id, "session superseded while finishing");
                Ok(())
            }
            Err(_) => {
                warn!(session_id = %session_id, ?waited, "session-finished did not arrive");
                Err(TtsError::SessionFinishTimeout(waited))
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut st = self.shared.lock();
            if let Some(streamer) = st.reset_session() {
                streamer.cancel();
            }
            for waiter in [st.start_waiter.take(), st.finish_waiter.take()]
                .into_iter()
                .flatten()
            {
                let _ = waiter.send(Err(TtsError::Closed));
            }
        }
        if !self.client.is_closed() {
            let _ = self.send(&Message::client_event(
                EventType::FinishConnection,
                EMPTY_PAYLOAD,
            ));
        }
        self.client.close();
        info!(connect_id = %self.connect_id, "tts engine closed");
        Ok(())
    }

    fn word_timestamps(&self) -> Vec<SentenceTiming> {
        self.shared.lock().timings.clone()
    }

    fn session_state(&self) -> SessionState {
        self.shared.lock().session
    }

    fn sample_rate(&self) -> u32 {
        self.config.audio.sample_rate
    }
}

impl Drop for VolcEngine {
    fn drop(&mut self) {
        let _ = Engine::close(&*self);
    }
}
