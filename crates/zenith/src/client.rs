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

//! Client facade for one Zenith session.
//!
//! [`ZenithClient`] spawns the session actor and exposes the public surface:
//! connect, subscribe/unsubscribe/publish, the emitted record stream, and
//! wind-down. One client instance is one independent engine and may be
//! connected, finalised and reconnected repeatedly.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use crate::{
    auth::AccessTokenProvider,
    common::enums::{MessageAction, Subscribability},
    config::ZenithClientConfig,
    error::{ZenithWsError, ZenithWsResult},
    events::SessionRecord,
    handler::{ClientCommand, SessionHandler},
    subscription::{RequestDefinition, SubscriptionId},
    transport::WsTransport,
};

/// Client for the Zenith streaming protocol.
pub struct ZenithClient {
    config: ZenithClientConfig,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    cmd_tx: Option<tokio::sync::mpsc::UnboundedSender<ClientCommand>>,
    out_rx: Option<tokio::sync::mpsc::UnboundedReceiver<SessionRecord>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    online: Arc<AtomicBool>,
    id_counter: AtomicU64,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for ZenithClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenithClient")
            .field("endpoint", &self.config.endpoint)
            .field("is_active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ZenithClient {
    /// Creates a client for the given configuration.
    #[must_use]
    pub fn new(config: ZenithClientConfig) -> Self {
        Self {
            config,
            token_provider: None,
            cmd_tx: None,
            out_rx: None,
            task_handle: None,
            online: Arc::new(AtomicBool::new(false)),
            id_counter: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Attaches the external access-token provider for the bearer-token flow.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Returns whether the session is currently online.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Returns whether the session actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task_handle.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Returns the configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Returns the cancellation token for this client.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Cancels the session and every pending request.
    pub fn cancel_all_requests(&self) {
        self.cancellation_token.cancel();
    }

    /// Establishes the session, spawning the actor on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the command channel to an existing actor is gone.
    pub fn connect(&mut self) -> anyhow::Result<()> {
        if self.cmd_tx.is_none() {
            let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
            let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
            let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();

            let transport = WsTransport::new(transport_tx);
            let handler = SessionHandler::new(
                self.config.clone(),
                transport,
                transport_rx,
                self.token_provider.clone(),
                cmd_rx,
                out_tx,
                self.online.clone(),
                self.cancellation_token.clone(),
            );
            self.task_handle = Some(tokio::spawn(handler.run()));
            self.cmd_tx = Some(cmd_tx);
            self.out_rx = Some(out_rx);
            tracing::info!("Connecting to Zenith publisher: {}", self.config.endpoint);
        }
        self.send_command(ClientCommand::Connect)
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Takes the emitted record stream.
    ///
    /// Returns `None` before `connect()` or if the stream was already taken.
    pub fn take_records(&mut self) -> Option<tokio::sync::mpsc::UnboundedReceiver<SessionRecord>> {
        self.out_rx.take()
    }

    /// Starts a streaming subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn subscribe(&self, definition: RequestDefinition) -> ZenithWsResult<SubscriptionId> {
        let id = self.next_id();
        self.send_command(ClientCommand::Subscribe { id, definition })?;
        Ok(id)
    }

    /// Creates a dormant subscription for later [`activate`](Self::activate).
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn subscribe_deferred(
        &self,
        definition: RequestDefinition,
    ) -> ZenithWsResult<SubscriptionId> {
        let id = self.next_id();
        self.send_command(ClientCommand::SubscribeDeferred { id, definition })?;
        Ok(id)
    }

    /// Activates a dormant subscription under the given request number.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn activate(&self, id: SubscriptionId, request_nr: u64) -> ZenithWsResult<()> {
        self.send_command(ClientCommand::Activate { id, request_nr })
    }

    /// Sends a one-shot Publish query.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn publish(
        &self,
        controller: Ustr,
        topic: Ustr,
        params: serde_json::Value,
        resend_allowed: bool,
    ) -> ZenithWsResult<SubscriptionId> {
        let definition = RequestDefinition {
            resend_allowed,
            ..RequestDefinition::query(controller, topic, params)
        };
        debug_assert_eq!(definition.action, MessageAction::Publish);
        self.subscribe(definition)
    }

    /// Requests removal of a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> ZenithWsResult<()> {
        self.send_command(ClientCommand::Unsubscribe { id })
    }

    /// Reports the session's subscribability level.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn note_subscribability(&self, level: Subscribability) -> ZenithWsResult<()> {
        self.send_command(ClientCommand::NoteSubscribability(level))
    }

    /// Winds the session down.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not connected.
    pub fn close(&self) -> ZenithWsResult<()> {
        tracing::info!("Closing Zenith session");
        self.send_command(ClientCommand::Close)
    }

    /// Waits until the session is online or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout expires first.
    pub async fn wait_until_active(&self, timeout_secs: f64) -> ZenithWsResult<()> {
        let timeout = std::time::Duration::from_secs_f64(timeout_secs);
        tokio::time::timeout(timeout, async {
            while !self.is_active() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| {
            ZenithWsError::Timeout(format!("session not online after {timeout_secs} seconds"))
        })
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn send_command(&self, command: ClientCommand) -> ZenithWsResult<()> {
        let tx = self.cmd_tx.as_ref().ok_or(ZenithWsError::NotConnected)?;
        tx.send(command)
            .map_err(|e| ZenithWsError::Send(e.to_string()))
    }
}
