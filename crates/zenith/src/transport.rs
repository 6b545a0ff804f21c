// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Socket transport seam.
//!
//! The engine consumes the transport through the [`SocketTransport`] trait so
//! tests can inject a channel-backed mock. The production implementation
//! splits a tokio-tungstenite stream into a writer held by the caller and a
//! reader task that forwards frames into the session's event channel.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::error::{ZenithWsError, ZenithWsResult};

/// Events delivered by the transport to the session actor.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Closed {
        code: Option<u16>,
        reason: Option<String>,
        clean: bool,
    },
    Error(String),
}

/// Socket readiness, mirroring the WebSocket ready-state model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Transport consumed by the session actor.
#[async_trait]
pub trait SocketTransport: Send {
    /// Opens the socket towards `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn open(&mut self, endpoint: &str) -> ZenithWsResult<()>;

    /// Sends one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not open or the write fails.
    async fn send(&mut self, text: String) -> ZenithWsResult<()>;

    /// Requests a close handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be written.
    async fn close(&mut self, code: u16, reason: &str) -> ZenithWsResult<()>;

    /// Returns the current socket readiness.
    fn ready_state(&self) -> ReadyState;
}

type WsWriter =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Production transport over tokio-tungstenite.
#[derive(Debug)]
pub struct WsTransport {
    event_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    writer: Option<WsWriter>,
    read_task: Option<tokio::task::JoinHandle<()>>,
    state: Arc<AtomicU8>,
}

impl WsTransport {
    /// Creates a transport delivering events into the given channel.
    #[must_use]
    pub fn new(event_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            event_tx,
            writer: None,
            read_task: None,
            state: Arc::new(AtomicU8::new(ReadyState::Closed.as_u8())),
        }
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    fn spawn_read_task(
        &mut self,
        mut reader: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) {
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let mut close_sent = false;
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let _ = event_tx.send(TransportEvent::Message(text.to_string()));
                    }
                    Ok(Message::Close(frame)) => {
                        state.store(ReadyState::Closed.as_u8(), Ordering::Relaxed);
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), Some(f.reason.to_string())))
                            .unwrap_or((None, None));
                        let _ = event_tx.send(TransportEvent::Closed {
                            code,
                            reason,
                            clean: true,
                        });
                        close_sent = true;
                        break;
                    }
                    Ok(_) => {} // Ping/pong handled by tungstenite; binary unused
                    Err(e) => {
                        state.store(ReadyState::Closed.as_u8(), Ordering::Relaxed);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        let _ = event_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: None,
                            clean: false,
                        });
                        close_sent = true;
                        break;
                    }
                }
            }
            if !close_sent {
                // Stream ended without a close frame.
                state.store(ReadyState::Closed.as_u8(), Ordering::Relaxed);
                let _ = event_tx.send(TransportEvent::Closed {
                    code: None,
                    reason: None,
                    clean: false,
                });
            }
            tracing::debug!("Transport read task stopped");
        });
        self.read_task = Some(task);
    }
}

#[async_trait]
impl SocketTransport for WsTransport {
    async fn open(&mut self, endpoint: &str) -> ZenithWsResult<()> {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        self.set_state(ReadyState::Connecting);

        let (stream, _) = connect_async(endpoint).await.map_err(|e| {
            self.set_state(ReadyState::Closed);
            ZenithWsError::Transport(e.to_string())
        })?;

        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.set_state(ReadyState::Open);
        self.spawn_read_task(reader);
        let _ = self.event_tx.send(TransportEvent::Opened);
        tracing::debug!("Transport opened to {endpoint}");
        Ok(())
    }

    async fn send(&mut self, text: String) -> ZenithWsResult<()> {
        let writer = self.writer.as_mut().ok_or(ZenithWsError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ZenithWsError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> ZenithWsResult<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.set_state(ReadyState::Closing);
        let writer = self.writer.as_mut().unwrap();
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        writer
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ZenithWsError::Send(e.to_string()))
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_ready_state_round_trip() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut transport = WsTransport::new(tx);
        assert_eq!(transport.ready_state(), ReadyState::Closed);
        assert!(matches!(
            transport.send("frame".to_string()).await,
            Err(ZenithWsError::NotConnected)
        ));
    }
}
