//! Binary framing and JSON request payloads for the Volcengine bidirectional
//! TTS websocket API.
//!
//! Every frame starts with a four byte header followed by optional fields
//! selected by the header, then a length-prefixed payload. All integers are
//! big-endian.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::Serialize;

use crate::error::{Result, TtsError};

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const NAMESPACE: &str = "BidirectionalTTS";

/// Header size in 4-byte words written by [`encode`].
const HEADER_WORDS: u8 = 0b0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    FullClientRequest,
    AudioOnlyClient,
    FullServerResponse,
    AudioOnlyServer,
    FrontEndResultServer,
    Error,
}

impl MsgType {
    fn bits(self) -> u8 {
        match self {
            MsgType::FullClientRequest => 0b0001,
            MsgType::AudioOnlyClient => 0b0010,
            MsgType::FullServerResponse => 0b1001,
            MsgType::AudioOnlyServer => 0b1011,
            MsgType::FrontEndResultServer => 0b1100,
            MsgType::Error => 0b1111,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0b0001 => MsgType::FullClientRequest,
            0b0010 => MsgType::AudioOnlyClient,
            0b1001 => MsgType::FullServerResponse,
            0b1011 => MsgType::AudioOnlyServer,
            0b1100 => MsgType::FrontEndResultServer,
            0b1111 => MsgType::Error,
            other => return Err(malformed(format!("unknown message type {other:#06b}"))),
        })
    }
}

/// Message-type specific flags. The values are exclusive, not a bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgFlags {
    NoSeq,
    PositiveSeq,
    LastNoSeq,
    NegativeSeq,
    WithEvent,
}

impl MsgFlags {
    fn bits(self) -> u8 {
        match self {
            MsgFlags::NoSeq => 0b0000,
            MsgFlags::PositiveSeq => 0b0001,
            MsgFlags::LastNoSeq => 0b0010,
            MsgFlags::NegativeSeq => 0b0011,
            MsgFlags::WithEvent => 0b0100,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0b0000 => MsgFlags::NoSeq,
            0b0001 => MsgFlags::PositiveSeq,
            0b0010 => MsgFlags::LastNoSeq,
            0b0011 => MsgFlags::NegativeSeq,
            0b0100 => MsgFlags::WithEvent,
            other => return Err(malformed(format!("unknown message flags {other:#06b}"))),
        })
    }

    fn has_sequence(self) -> bool {
        matches!(self, MsgFlags::PositiveSeq | MsgFlags::NegativeSeq)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Serialization {
    Raw,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    None,
    StartConnection,
    FinishConnection,
    ConnectionStarted,
    ConnectionFailed,
    ConnectionFinished,
    StartSession,
    CancelSession,
    FinishSession,
    SessionStarted,
    SessionCanceled,
    SessionFinished,
    SessionFailed,
    UsageResponse,
    TaskRequest,
    UpdateConfig,
    TtsSentenceStart,
    TtsSentenceEnd,
    TtsResponse,
    TtsEnded,
    Other(i32),
}

impl EventType {
    pub fn code(self) -> i32 {
        match self {
            EventType::None => 0,
            EventType::StartConnection => 1,
            EventType::FinishConnection => 2,
            EventType::ConnectionStarted => 50,
            EventType::ConnectionFailed => 51,
            EventType::ConnectionFinished => 52,
            EventType::StartSession => 100,
            EventType::CancelSession => 101,
            EventType::FinishSession => 102,
            EventType::SessionStarted => 150,
            EventType::SessionCanceled => 151,
            EventType::SessionFinished => 152,
            EventType::SessionFailed => 153,
            EventType::UsageResponse => 154,
            EventType::TaskRequest => 200,
            EventType::UpdateConfig => 201,
            EventType::TtsSentenceStart => 350,
            EventType::TtsSentenceEnd => 351,
            EventType::TtsResponse => 352,
            EventType::TtsEnded => 359,
            EventType::Other(code) => code,
        }
    }

    /// Connection-scoped events carry a connect id instead of a session id.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            EventType::StartConnection
                | EventType::FinishConnection
                | EventType::ConnectionStarted
                | EventType::ConnectionFailed
                | EventType::ConnectionFinished
        )
    }

    fn carries_connect_id(self) -> bool {
        matches!(
            self,
            EventType::ConnectionStarted
                | EventType::ConnectionFailed
                | EventType::ConnectionFinished
        )
    }

    fn carries_session_id(self) -> bool {
        self != EventType::None && !self.is_connection_level()
    }
}

impl From<i32> for EventType {
    fn from(code: i32) -> Self {
        match code {
            0 => EventType::None,
            1 => EventType::StartConnection,
            2 => EventType::FinishConnection,
            50 => EventType::ConnectionStarted,
            51 => EventType::ConnectionFailed,
            52 => EventType::ConnectionFinished,
            100 => EventType::StartSession,
            101 => EventType::CancelSession,
            102 => EventType::FinishSession,
            150 => EventType::SessionStarted,
            151 => EventType::SessionCanceled,
            152 => EventType::SessionFinished,
            153 => EventType::SessionFailed,
            154 => EventType::UsageResponse,
            200 => EventType::TaskRequest,
            201 => EventType::UpdateConfig,
            350 => EventType::TtsSentenceStart,
            351 => EventType::TtsSentenceEnd,
            352 => EventType::TtsResponse,
            359 => EventType::TtsEnded,
            other => EventType::Other(other),
        }
    }
}

/// One decoded protocol frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub msg_type: MsgType,
    pub flags: MsgFlags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub event: EventType,
    pub session_id: String,
    pub connect_id: String,
    pub sequence: i32,
    pub error_code: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MsgType, flags: MsgFlags) -> Self {
        Self {
            msg_type,
            flags,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: EventType::None,
            session_id: String::new(),
            connect_id: String::new(),
            sequence: 0,
            error_code: 0,
            payload: Vec::new(),
        }
    }

    /// A JSON client request carrying an event.
    pub fn client_event(event: EventType, payload: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(MsgType::FullClientRequest, MsgFlags::WithEvent);
        msg.event = event;
        msg.payload = payload.into();
        msg
    }

    /// A JSON server response carrying an event.
    pub fn server_event(event: EventType, payload: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(MsgType::FullServerResponse, MsgFlags::WithEvent);
        msg.event = event;
        msg.payload = payload.into();
        msg
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_connect_id(mut self, connect_id: impl Into<String>) -> Self {
        self.connect_id = connect_id.into();
        self
    }

    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.msg_type)?;
        if self.event != EventType::None {
            write!(f, " event={:?}", self.event)?;
        }
        if !self.session_id.is_empty() {
            write!(f, " session_id={}", self.session_id)?;
        }
        if !self.connect_id.is_empty() {
            write!(f, " connect_id={}", self.connect_id)?;
        }
        if self.msg_type == MsgType::Error {
            write!(f, " error_code={}", self.error_code)?;
        }
        match (self.msg_type, self.serialization) {
            (MsgType::AudioOnlyServer | MsgType::AudioOnlyClient, _) | (_, Serialization::Raw) => {
                write!(f, " payload=<{} bytes>", self.payload.len())
            }
            _ => write!(f, " payload={}", self.payload_text()),
        }
    }
}

fn malformed(reason: impl Into<String>) -> TtsError {
    TtsError::MalformedFrame(reason.into())
}

pub fn encode_into(buf: &mut Vec<u8>, msg: &Message) -> Result<()> {
    buf.clear();
    buf.put_u8((PROTOCOL_VERSION << 4) | HEADER_WORDS);
    buf.put_u8((msg.msg_type.bits() << 4) | msg.flags.bits());
    let serialization = match msg.serialization {
        Serialization::Raw => 0b0000,
        Serialization::Json => 0b0001,
    };
    let compression = match msg.compression {
        Compression::None => 0b0000,
        Compression::Gzip => 0b0001,
    };
    buf.put_u8((serialization << 4) | compression);
    buf.put_u8(0);

    if msg.flags.has_sequence() {
        buf.put_i32(msg.sequence);
    }
    if msg.msg_type == MsgType::Error {
        buf.put_u32(msg.error_code);
    }
    if msg.flags == MsgFlags::WithEvent {
        buf.put_i32(msg.event.code());
        if msg.event.carries_session_id() {
            if msg.session_id.is_empty() {
                return Err(malformed(format!(
                    "{:?} requires a session id",
                    msg.event
                )));
            }
            put_string(buf, &msg.session_id)?;
        }
        if msg.event.carries_connect_id() {
            put_string(buf, &msg.connect_id)?;
        }
    }
    put_bytes(buf, &msg.payload)
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + msg.session_id.len() + msg.payload.len());
    encode_into(&mut buf, msg)?;
    Ok(buf)
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    put_bytes(buf, value.as_bytes())
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| malformed("field exceeds u32 length"))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

pub fn decode(mut bytes: &[u8]) -> Result<Message> {
    if bytes.remaining() < 4 {
        return Err(malformed(format!("header needs 4 bytes, got {}", bytes.len())));
    }
    let b0 = bytes.get_u8();
    let b1 = bytes.get_u8();
    let b2 = bytes.get_u8();
    let _reserved = bytes.get_u8();

    let version = b0 >> 4;
    if version != PROTOCOL_VERSION {
        return Err(malformed(format!("unsupported protocol version {version}")));
    }
    let header_words = (b0 & 0x0f) as usize;
    if header_words == 0 {
        return Err(malformed("header size is zero"));
    }
    skip(&mut bytes, (header_words - 1) * 4, "extended header")?;

    let mut msg = Message::new(MsgType::from_bits(b1 >> 4)?, MsgFlags::from_bits(b1 & 0x0f)?);
    msg.serialization = match b2 >> 4 {
        0b0000 => Serialization::Raw,
        0b0001 => Serialization::Json,
        other => return Err(malformed(format!("unknown serialization {other:#06b}"))),
    };
    msg.compression = match b2 & 0x0f {
        0b0000 => Compression::None,
        0b0001 => Compression::Gzip,
        other => return Err(malformed(format!("unknown compression {other:#06b}"))),
    };

    if msg.flags.has_sequence() {
        msg.sequence = read_u32(&mut bytes, "sequence")? as i32;
    }
    if msg.msg_type == MsgType::Error {
        msg.error_code = read_u32(&mut bytes, "error code")?;
    }
    if msg.flags == MsgFlags::WithEvent {
        msg.event = EventType::from(read_u32(&mut bytes, "event")? as i32);
        if msg.event.carries_session_id() {
            msg.session_id = read_string(&mut bytes, "session id")?;
        }
        if msg.event.carries_connect_id() {
            msg.connect_id = read_string(&mut bytes, "connect id")?;
        }
    }
    msg.payload = read_field(&mut bytes, "payload")?.to_vec();

    if bytes.has_remaining() {
        return Err(malformed(format!(
            "{} trailing bytes after payload",
            bytes.remaining()
        )));
    }
    Ok(msg)
}

fn skip(bytes: &mut &[u8], n: usize, what: &str) -> Result<()> {
    if bytes.remaining() < n {
        return Err(malformed(format!("truncated {what}")));
    }
    bytes.advance(n);
    Ok(())
}

fn read_u32(bytes: &mut &[u8], what: &str) -> Result<u32> {
    if bytes.remaining() < 4 {
        return Err(malformed(format!("truncated {what}")));
    }
    Ok(bytes.get_u32())
}

fn read_field<'a>(bytes: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let len = read_u32(bytes, what)? as usize;
    if bytes.len() < len {
        return Err(malformed(format!(
            "{what} length {len} exceeds remaining {} bytes",
            bytes.len()
        )));
    }
    let (field, rest) = bytes.split_at(len);
    *bytes = rest;
    Ok(field)
}

fn read_string(bytes: &mut &[u8], what: &str) -> Result<String> {
    let field = read_field(bytes, what)?;
    String::from_utf8(field.to_vec()).map_err(|_| malformed(format!("{what} is not utf-8")))
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct User {
    pub uid: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub speech_rate: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    pub enable_timestamp: bool,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ReqParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_params: Option<AudioParams>,
    /// JSON encoded as a string, e.g. `{"context_texts":["..."]}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additions: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    pub event: i32,
    pub namespace: &'static str,
    pub req_params: ReqParams,
}

#[derive(Serialize)]
struct Additions<'a> {
    context_texts: &'a [String],
}

impl Request {
    pub fn new(event: EventType, req_params: ReqParams) -> Self {
        Self {
            user: None,
            event: event.code(),
            namespace: NAMESPACE,
            req_params,
        }
    }

    pub fn start_session(
        speaker: &str,
        audio_params: AudioParams,
        context_texts: &[String],
    ) -> Result<Self> {
        let additions = if context_texts.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&Additions { context_texts })?)
        };
        Ok(Self::new(
            EventType::StartSession,
            ReqParams {
                speaker: Some(speaker.to_string()),
                audio_params: Some(audio_params),
                additions,
                ..ReqParams::default()
            },
        ))
    }

    pub fn task(text: &str) -> Self {
        Self::new(
            EventType::TaskRequest,
            ReqParams {
                text: Some(text.to_string()),
                ..ReqParams::default()
            },
        )
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Payload for start-connection, finish-connection and finish-session.
pub const EMPTY_PAYLOAD: &[u8] = b"{}";

/// Maps a speed ratio (1.0 = normal) onto the provider's [-50, 100] scale.
pub fn speech_rate(ratio: f32) -> i32 {
    let rate = if ratio <= 1.0 {
        -50.0 + 50.0 * ratio
    } else {
        100.0 * (ratio - 1.0)
    };
    rate.clamp(-50.0, 100.0) as i32
}
