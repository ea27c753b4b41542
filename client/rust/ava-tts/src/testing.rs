//! In-memory websocket peers and a scripted provider for unit tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::protocol::{self, EMPTY_PAYLOAD, EventType, Message, MsgFlags, MsgType, Serialization};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    tokio::join!(
        WebSocketStream::from_raw_socket(a, Role::Client, None),
        WebSocketStream::from_raw_socket(b, Role::Server, None),
    )
}

pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should become true");
}

pub(crate) fn pcm_silence(seconds: f64, sample_rate: u32) -> Vec<u8> {
    vec![0u8; (seconds * sample_rate as f64) as usize * 2]
}

/// Server side of the protocol, driven step by step from a test.
pub(crate) struct FakeProvider {
    ws: WebSocketStream<DuplexStream>,
}

impl FakeProvider {
    pub(crate) fn new(ws: WebSocketStream<DuplexStream>) -> Self {
        Self { ws }
    }

    /// Next protocol frame from the client, `None` once the socket ends.
    pub(crate) async fn recv(&mut self) -> Option<Message> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("client frame should arrive in time");
            match next {
                Some(Ok(WsMessage::Binary(data))) => {
                    return Some(protocol::decode(&data).expect("client frame should decode"));
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub(crate) async fn expect(&mut self, event: EventType) -> Message {
        let msg = self.recv().await.expect("client should still be connected");
        assert_eq!(msg.event, event, "unexpected frame: {msg}");
        msg
    }

    pub(crate) async fn send(&mut self, msg: Message) {
        let bytes = protocol::encode(&msg).expect("server frame should encode");
        self.ws
            .send(WsMessage::Binary(bytes.into()))
            .await
            .expect("send to client should succeed");
    }

    pub(crate) async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws
            .send(WsMessage::Binary(bytes.into()))
            .await
            .expect("send to client should succeed");
    }

    /// Answers the client's start-connection.
    pub(crate) async fn accept(&mut self) {
        self.expect(EventType::StartConnection).await;
        self.send(
            Message::server_event(EventType::ConnectionStarted, EMPTY_PAYLOAD)
                .with_connect_id("conn-test"),
        )
        .await;
    }

    /// Answers the next start-session and returns its request.
    pub(crate) async fn accept_session(&mut self) -> Message {
        let start = self.expect(EventType::StartSession).await;
        self.session_event(EventType::SessionStarted, &start.session_id, EMPTY_PAYLOAD)
            .await;
        start
    }

    pub(crate) async fn session_event(
        &mut self,
        event: EventType,
        session_id: &str,
        payload: &[u8],
    ) {
        self.send(Message::server_event(event, payload.to_vec()).with_session(session_id))
            .await;
    }

    pub(crate) async fn audio(&mut self, session_id: &str, pcm: Vec<u8>) {
        let mut msg = Message::new(MsgType::AudioOnlyServer, MsgFlags::WithEvent);
        msg.serialization = Serialization::Raw;
        msg.event = EventType::TtsResponse;
        msg.session_id = session_id.to_string();
        msg.payload = pcm;
        self.send(msg).await;
    }

    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
