//! Per-session event channel: decodes raw frames and forwards them without reordering.

use std::future::Future;

use futures::{Stream, StreamExt};
use shared::{domain::SessionId, protocol::StreamFrame};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    engine::SessionInput,
    error::{ClientError, Result},
};

const SIGNAL_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Opened,
    Frame(StreamFrame),
    Closed,
    Error(String),
}

impl From<TransportSignal> for SessionInput {
    fn from(signal: TransportSignal) -> Self {
        match signal {
            TransportSignal::Opened => SessionInput::TransportOpened,
            TransportSignal::Frame(frame) => SessionInput::Frame(frame),
            TransportSignal::Closed => SessionInput::TransportClosed,
            TransportSignal::Error(detail) => SessionInput::TransportError(detail),
        }
    }
}

/// Receiving end of a producer. Dropping it cancels the producer task.
pub struct EventSource {
    rx: mpsc::Receiver<TransportSignal>,
    task: JoinHandle<()>,
}

impl EventSource {
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<TransportSignal>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let task = tokio::spawn(producer(tx));
        Self { rx, task }
    }

    pub async fn next(&mut self) -> Option<TransportSignal> {
        self.rx.recv().await
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn session_ws_url(ws_base_url: &str, session_id: &SessionId) -> Result<Url> {
    let mut url = Url::parse(ws_base_url)
        .map_err(|err| ClientError::Config(format!("invalid ws_base_url {ws_base_url}: {err}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ClientError::Config(format!(
            "ws_base_url must start with ws:// or wss://, got {ws_base_url}"
        )));
    }
    url.path_segments_mut()
        .map_err(|_| ClientError::Config(format!("ws_base_url cannot be a base: {ws_base_url}")))?
        .pop_if_empty()
        .push(session_id.as_str());
    Ok(url)
}

pub async fn connect(ws_base_url: &str, session_id: &SessionId) -> Result<EventSource> {
    let url = session_ws_url(ws_base_url, session_id)?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ClientError::Transport(format!("failed to connect websocket {url}: {err}")))?;
    info!(%session_id, %url, "transport: websocket connected");

    let session_id = session_id.clone();
    Ok(EventSource::spawn(move |tx| {
        forward_frames(ws_stream, tx, session_id)
    }))
}

pub(crate) async fn forward_frames<S>(
    mut stream: S,
    tx: mpsc::Sender<TransportSignal>,
    session_id: SessionId,
) where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    if tx.send(TransportSignal::Opened).await.is_err() {
        return;
    }
    while let Some(message) = stream.next().await {
        let signal = match message {
            Ok(Message::Text(text)) => match decode_frame(&text, &session_id) {
                Some(frame) => TransportSignal::Frame(frame),
                None => continue,
            },
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => match decode_frame(text, &session_id) {
                    Some(frame) => TransportSignal::Frame(frame),
                    None => continue,
                },
                Err(err) => {
                    warn!(%session_id, error = %err, "transport: dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(close)) => {
                debug!(%session_id, ?close, "transport: close frame received");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                let _ = tx
                    .send(TransportSignal::Error(format!("websocket receive failed: {err}")))
                    .await;
                return;
            }
        };
        if tx.send(signal).await.is_err() {
            debug!(%session_id, "transport: consumer gone; stopping");
            return;
        }
    }
    let _ = tx.send(TransportSignal::Closed).await;
}

/// Unknown or malformed frames are dropped, never fatal.
fn decode_frame(text: &str, session_id: &SessionId) -> Option<StreamFrame> {
    match StreamFrame::decode(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(%session_id, error = %err, "transport: dropping malformed frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
