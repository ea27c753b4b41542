//! Full-duplex websocket transport with callback delivery.
//!
//! A [`WsClient`] owns two tasks: an inbound loop forwarding frames to an
//! [`EventHandler`] and an outbound loop draining a queue of frames to send.
//! Sends never block the caller. [`WsClient::close`] may be called from any
//! task or from inside a handler callback; only the first call has an effect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, TtsError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Receives transport events. Callbacks run on the transport's tasks and
/// must not block.
pub trait EventHandler: Send + Sync + 'static {
    /// Runs before either loop starts; frames sent here go out first.
    fn on_open(&self, client: &WsClient);

    fn on_message(&self, client: &WsClient, kind: FrameKind, data: &[u8]);

    fn on_error(&self, client: &WsClient, error: &TtsError);

    /// Runs exactly once, on the first call to [`WsClient::close`].
    fn on_close(&self, client: &WsClient);
}

#[derive(Debug)]
enum SendCmd {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<SendCmd>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn close_code_message(code: u16, reason: &str) -> String {
    let reason = reason.trim();
    let reason_suffix = if reason.is_empty() {
        String::new()
    } else {
        format!(" (reason: {reason})")
    };

    match code {
        1000 => format!("normal closure{reason_suffix}"),
        1001 => format!("server going away (close code 1001){reason_suffix}"),
        1008 => format!("policy violation (close code 1008){reason_suffix}"),
        1011 => format!("server error (close code 1011){reason_suffix}"),
        other => format!("websocket closed (code {other}){reason_suffix}"),
    }
}

impl WsClient {
    /// Dials `url` with the extra handshake `headers` and starts the loops.
    pub async fn connect(
        url: &str,
        headers: HeaderMap,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| TtsError::Config(format!("invalid url: {e}")))?;
        let mut req = url.as_str().into_client_request()?;
        req.headers_mut().extend(headers);

        let (ws_stream, resp) = connect_async(req).await?;
        info!(url = %url, status = %resp.status(), "websocket connected");
        if let Some(logid) = resp.headers().get("x-tt-logid") {
            debug!(logid = ?logid, "provider log id");
        }

        Ok(Self::start(ws_stream, handler))
    }

    /// Starts the loops over an already established stream.
    pub fn start<S>(ws_stream: WebSocketStream<S>, handler: Arc<dyn EventHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(Inner {
                tx,
                shutdown,
                closed: AtomicBool::new(false),
                handler,
            }),
        };

        let write_shutdown = client.inner.shutdown.subscribe();
        let read_shutdown = client.inner.shutdown.subscribe();

        client.inner.handler.on_open(&client);

        let (ws_write, ws_read) = ws_stream.split();
        tokio::spawn(write_loop(client.clone(), ws_write, rx, write_shutdown));
        tokio::spawn(read_loop(client.clone(), ws_read, read_shutdown));
        client
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.enqueue(SendCmd::Text(text.into()));
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) {
        self.enqueue(SendCmd::Binary(data.into()));
    }

    fn enqueue(&self, cmd: SendCmd) {
        if self.is_closed() {
            debug!("transport closing, dropping outbound frame");
            return;
        }
        if self.inner.tx.send(cmd).is_err() {
            debug!("outbound loop gone, dropping outbound frame");
        }
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        debug!("websocket transport closing");
        self.inner.handler.on_close(self);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn fail(&self, error: TtsError) {
        self.inner.handler.on_error(self, &error);
        self.close();
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn write_loop<S>(
    client: WsClient,
    mut ws_write: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<SendCmd>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                if let Err(e) = ws_write.send(to_message(cmd)).await {
                    client.fail(e.into());
                    return;
                }
            }
            _ = closed(&mut shutdown) => break,
        }
    }

    // Frames queued before close still go out, then the close frame.
    while let Ok(cmd) = rx.try_recv() {
        if ws_write.send(to_message(cmd)).await.is_err() {
            return;
        }
    }
    let _ = ws_write.send(Message::Close(None)).await;
}

fn to_message(cmd: SendCmd) -> Message {
    match cmd {
        SendCmd::Text(text) => Message::Text(text.into()),
        SendCmd::Binary(data) => Message::Binary(data),
    }
}

async fn read_loop<S>(
    client: WsClient,
    mut ws_read: SplitStream<WebSocketStream<S>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = closed(&mut shutdown) => break,
            item = ws_read.next() => item,
        };

        let Some(item) = item else {
            debug!("websocket stream ended");
            client.close();
            break;
        };

        match item {
            Ok(Message::Binary(data)) => {
                client
                    .inner
                    .handler
                    .on_message(&client, FrameKind::Binary, &data);
            }
            Ok(Message::Text(text)) => {
                client
                    .inner
                    .handler
                    .on_message(&client, FrameKind::Text, text.as_bytes());
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (frame.code.into(), frame.reason.to_string()),
                    None => (1000u16, String::new()),
                };
                let message = close_code_message(code, &reason);
                if code == 1000 {
                    info!(code, "{message}");
                } else {
                    warn!(code, "{message}");
                }
                client.close();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                client.fail(e.into());
                break;
            }
        }
    }
}
