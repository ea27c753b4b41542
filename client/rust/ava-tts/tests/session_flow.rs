use std::sync::Arc;
use std::time::Duration;

use ava_tts::protocol::{self, EMPTY_PAYLOAD, EventType, Message, MsgFlags, MsgType, Serialization};
use ava_tts::{Engine, EngineConfig, SayRequest, SessionState, Speaker, VolcEngine};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::Role;

const TIMING: &[u8] = br#"{"text":"hello world","words":[
    {"word":"hello","startTime":0.0,"endTime":0.5,"confidence":0.99},
    {"word":"world","startTime":0.5,"endTime":1.0,"confidence":0.99}]}"#;

async fn recv(ws: &mut WebSocketStream<DuplexStream>) -> Option<Message> {
    loop {
        match ws.next().await? {
            Ok(WsMessage::Binary(data)) => {
                return Some(protocol::decode(&data).expect("decodable frame"));
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn send(ws: &mut WebSocketStream<DuplexStream>, msg: Message) {
    let bytes = protocol::encode(&msg).expect("encodable frame");
    ws.send(WsMessage::Binary(bytes.into())).await.expect("send");
}

fn audio(session_id: &str, pcm: Vec<u8>) -> Message {
    let mut msg = Message::new(MsgType::AudioOnlyServer, MsgFlags::WithEvent);
    msg.serialization = Serialization::Raw;
    msg.event = EventType::TtsResponse;
    msg.session_id = session_id.to_string();
    msg.payload = pcm;
    msg
}

/// Plays the provider side of one utterance: one second of audio in two
/// chunks followed by the sentence timing.
async fn provider(mut ws: WebSocketStream<DuplexStream>) -> Vec<EventType> {
    let mut seen = Vec::new();
    while let Some(msg) = recv(&mut ws).await {
        seen.push(msg.event);
        match msg.event {
            EventType::StartConnection => {
                send(
                    &mut ws,
                    Message::server_event(EventType::ConnectionStarted, EMPTY_PAYLOAD)
                        .with_connect_id("conn-1"),
                )
                .await;
            }
            EventType::StartSession => {
                send(
                    &mut ws,
                    Message::server_event(EventType::SessionStarted, EMPTY_PAYLOAD)
                        .with_session(msg.session_id),
                )
                .await;
            }
            EventType::TaskRequest => {
                for _ in 0..2 {
                    send(&mut ws, audio(&msg.session_id, vec![0u8; 16_000])).await;
                }
                send(
                    &mut ws,
                    Message::server_event(EventType::TtsSentenceEnd, TIMING)
                        .with_session(msg.session_id),
                )
                .await;
            }
            EventType::FinishSession => {
                send(
                    &mut ws,
                    Message::server_event(EventType::SessionFinished, EMPTY_PAYLOAD)
                        .with_session(msg.session_id),
                )
                .await;
            }
            EventType::FinishConnection => {
                let _ = ws.close(None).await;
                break;
            }
            _ => {}
        }
    }
    seen
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should become true");
}

#[tokio::test]
async fn utterance_progress_follows_playback() {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (client_ws, server_ws) = tokio::join!(
        WebSocketStream::from_raw_socket(a, Role::Client, None),
        WebSocketStream::from_raw_socket(b, Role::Server, None),
    );
    let provider = tokio::spawn(provider(server_ws));

    let engine = VolcEngine::with_stream(client_ws, EngineConfig::new("app", "key", "voice"))
        .await
        .expect("engine should connect");
    let speaker = Arc::new(Speaker::headless(engine));

    speaker
        .say(SayRequest::start().with_emotion("happy"))
        .await
        .expect("start");
    speaker.say(SayRequest::text("hello world")).await.expect("text");
    eventually(|| speaker.engine().word_timestamps().len() == 1).await;

    // 0.6 s at 16 kHz mono.
    let mut out = vec![[0.0f32; 2]; 9_600];
    assert_eq!(speaker.queue().stream(&mut out), (9_600, true));

    let progress = speaker.progress();
    assert!((progress.current_time - 0.6).abs() < 1e-9);
    assert_eq!(progress.total_time, 1.0);
    assert!((progress.percentage - 60.0).abs() < 1e-6);
    assert_eq!(progress.current_word.map(|w| w.word).as_deref(), Some("world"));
    assert_eq!(progress.played_text, "hello");

    speaker.say(SayRequest::end()).await.expect("end");
    assert_eq!(speaker.engine().session_state(), SessionState::Idle);

    // Remaining 0.4 s drains, then the queue reports empty again.
    let mut rest = vec![[0.0f32; 2]; 9_600];
    assert_eq!(speaker.queue().stream(&mut rest), (6_400, true));
    assert_eq!(speaker.queue().stream(&mut rest), (0, true));
    assert!(speaker.is_idle());

    speaker.close().expect("close");
    let seen = provider.await.expect("provider task");
    assert_eq!(
        seen,
        vec![
            EventType::StartConnection,
            EventType::StartSession,
            EventType::TaskRequest,
            EventType::FinishSession,
            EventType::FinishConnection,
        ]
    );
}
