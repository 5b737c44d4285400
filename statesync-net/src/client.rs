//! Minimal WebSocket client for the sync protocol.
//!
//! The client owns no reactive state: it encodes [`Input`] frames onto the
//! socket and hands decoded [`Output`] frames back to the caller in arrival
//! order. View application, reconnection policy and local prediction are the
//! embedding application's concern.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{EntityIndexes, Input, InputBody, Output, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("connection closed")]
    Closed,
}

/// A connected sync client.
pub struct SyncClient {
    input_tx: mpsc::UnboundedSender<Input>,
    output_rx: mpsc::UnboundedReceiver<Output>,
}

impl SyncClient {
    /// Connect and spawn the socket pump.
    pub async fn connect(url: &str) -> Result<SyncClient, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Input>();
        let (output_tx, output_rx) = mpsc::unbounded_channel::<Output>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    queued = input_rx.recv() => {
                        let Some(input) = queued else { break };
                        let text = match input.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("failed to encode input: {e}");
                                continue;
                            }
                        };
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    inbound = ws_receiver.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match Output::decode(text.as_str()) {
                                    Ok(output) => {
                                        if output_tx.send(output).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => log::debug!("malformed server frame: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::debug!("websocket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(SyncClient {
            input_tx,
            output_rx,
        })
    }

    /// Queue one frame for sending. Returns its id for correlating a later
    /// `return` frame.
    pub fn send(&self, input: Input) -> Result<String, ClientError> {
        let id = input.id.clone();
        self.input_tx.send(input).map_err(|_| ClientError::Closed)?;
        Ok(id)
    }

    /// Write properties of an entity.
    pub fn write(
        &self,
        entity: EntityIndexes,
        changes: serde_json::Map<String, Value>,
    ) -> Result<String, ClientError> {
        self.send(Input::new(InputBody::Write { entity, changes }))
    }

    /// Invoke a method on an entity.
    pub fn call(
        &self,
        entity: EntityIndexes,
        method: impl Into<String>,
        parameters: Vec<Value>,
    ) -> Result<String, ClientError> {
        self.send(Input::new(InputBody::Call {
            entity,
            method: method.into(),
            parameters,
        }))
    }

    /// Send an opaque message to the host.
    pub fn message(&self, payload: Value) -> Result<String, ClientError> {
        self.send(Input::new(InputBody::Message(payload)))
    }

    /// Next server frame, in arrival order. `None` once the connection is
    /// gone.
    pub async fn next_output(&mut self) -> Option<Output> {
        self.output_rx.recv().await
    }
}
