//! WebSocket client for the note sync protocol.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Join / change / delete / leave requests
//! - Incoming server events through an mpsc receiver

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::model::BlockNode;
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// An event from the server
    Server(ServerEvent),
}

/// The note client.
pub struct NoteClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Document of the last JoinNote sent, cleared on leave
    joined: Arc<RwLock<Option<Uuid>>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl NoteClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            joined: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let joined = self.joined.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match ServerEvent::decode(&text) {
                    Ok(event) => {
                        if event_tx.send(SyncEvent::Server(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            *joined.write().await = None;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Pending outgoing events are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        *self.joined.write().await = None;
    }

    async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = event.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(text).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn join(&self, document_id: Uuid, credential_token: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinNote {
            document_id,
            credential_token: credential_token.into(),
        })
        .await?;
        *self.joined.write().await = Some(document_id);
        Ok(())
    }

    /// Send the full content tree of a document.
    pub async fn send_change(
        &self,
        document_id: Uuid,
        blocks: Vec<BlockNode>,
        title: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::NoteChange {
            document_id,
            blocks,
            title,
        })
        .await
    }

    pub async fn send_delete(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::NoteDelete { document_id }).await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Leave).await?;
        *self.joined.write().await = None;
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Document of the last join request, if not left since.
    pub async fn joined_document(&self) -> Option<Uuid> {
        *self.joined.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = NoteClient::new("ws://localhost:9090");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = NoteClient::new("ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.joined_document().await.is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = NoteClient::new("ws://localhost:9090");
        let err = client.join(Uuid::new_v4(), "token").await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
        assert!(client.joined_document().await.is_none());
        assert!(client.send_delete(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = NoteClient::new(format!("ws://127.0.0.1:{port}"));
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = NoteClient::new("ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
