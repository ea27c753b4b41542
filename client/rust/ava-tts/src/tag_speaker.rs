//! Drives a [`Speaker`] from tagged model output such as
//! `<say emotion="calm">Hi there.</say><stop reason="interrupted"/>`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::speaker::{SayRequest, Speaker};
use crate::tags::{TagCallbacks, TagParser};

#[derive(Debug)]
enum Command {
    Say(SayRequest),
    Stop { reason: String },
}

/// Parser callbacks only enqueue; a worker task runs the commands in order,
/// so [`TagAwareSpeaker::feed`] never waits on the network.
pub struct TagAwareSpeaker<E: Engine> {
    parser: TagParser,
    worker: JoinHandle<()>,
    speaker: Arc<Speaker<E>>,
}

impl<E: Engine> TagAwareSpeaker<E> {
    pub fn new(speaker: Arc<Speaker<E>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut parser = TagParser::new();

        let (start_tx, middle_tx, end_tx) = (tx.clone(), tx.clone(), tx.clone());
        parser.register(
            "say",
            TagCallbacks::new()
                .on_start(move |attrs| {
                    let mut req = SayRequest::start();
                    if let Some(emotion) = attrs.get("emotion").filter(|e| !e.is_empty()) {
                        req = req.with_emotion(emotion.as_str());
                    }
                    if let Some(context) = attrs.get("context").filter(|c| !c.is_empty()) {
                        req = req.with_context(context.as_str());
                    }
                    let _ = start_tx.send(Command::Say(req));
                })
                .on_middle(move |text| {
                    let _ = middle_tx.send(Command::Say(SayRequest::text(text)));
                })
                .on_end(move || {
                    let _ = end_tx.send(Command::Say(SayRequest::end()));
                }),
        );
        parser.register(
            "stop",
            TagCallbacks::new().on_start(move |attrs| {
                let reason = attrs.get("reason").cloned().unwrap_or_default();
                let _ = tx.send(Command::Stop { reason });
            }),
        );

        let worker = tokio::spawn(run_commands(Arc::clone(&speaker), rx));
        Self {
            parser,
            worker,
            speaker,
        }
    }

    /// Feeds the next chunk of model output.
    pub fn feed(&mut self, chunk: &str) {
        self.parser.feed(chunk);
    }

    /// Forgets any half-parsed tag.
    pub fn reset(&mut self) {
        self.parser.reset();
    }

    pub fn speaker(&self) -> &Arc<Speaker<E>> {
        &self.speaker
    }

    /// Waits until every command fed so far has been handed to the speaker.
    pub async fn finish(self) {
        let Self { parser, worker, .. } = self;
        // The callbacks hold the only senders.
        drop(parser);
        if let Err(e) = worker.await {
            warn!(error = %e, "tag command worker panicked");
        }
    }
}

async fn run_commands<E: Engine>(
    speaker: Arc<Speaker<E>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Say(req) => {
                let (start, end) = (req.start, req.end);
                if let Err(e) = speaker.say(req).await {
                    warn!(error = %e, start, end, "say from tag failed");
                } else if start {
                    debug!("say tag opened");
                }
            }
            Command::Stop { reason } => {
                info!(reason = %reason, "stop tag");
                speaker.stop().await;
            }
        }
    }
}
