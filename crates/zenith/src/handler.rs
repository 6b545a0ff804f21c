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

//! Single-writer session actor.
//!
//! The handler runs in a dedicated tokio task and exclusively owns the
//! connection engine and subscription manager. All external events (client
//! commands, transport events, access-token fetch completions and timers)
//! are delivered into its serialized `tokio::select!` loop, so no state is
//! ever touched concurrently.
//!
//! Every asynchronous completion carries the fencing token captured when it
//! was scheduled; the engine discards stale ones, which is what makes the
//! actor safe across reconnects without explicit cancellation plumbing.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    auth::{
        AccessTokenProvider, FetchedAccessToken, SessionCredentials, build_owner_fetch,
        build_token_fetch,
    },
    common::enums::{AuthScheme, Subscribability},
    config::ZenithClientConfig,
    connection::{ConnectionStateEngine, EngineAction, EngineEvent, EngineState, WaitId},
    events::{CountersSnapshot, SessionRecord},
    messages::AuthReply,
    subscription::{RequestDefinition, SubscriptionId, ZenithSubscriptionManager},
    transport::{SocketTransport, TransportEvent},
};

/// Commands sent from the client facade to the actor.
#[derive(Debug)]
pub enum ClientCommand {
    /// Establish (or re-establish) the session.
    Connect,
    /// Wind the session down.
    Close,
    Subscribe {
        id: SubscriptionId,
        definition: RequestDefinition,
    },
    SubscribeDeferred {
        id: SubscriptionId,
        definition: RequestDefinition,
    },
    Activate {
        id: SubscriptionId,
        request_nr: u64,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    NoteSubscribability(Subscribability),
}

/// One outstanding Zenith token exchange, fenced by its wait id.
#[derive(Clone, Copy, Debug)]
struct PendingAuthExchange {
    transaction_id: u64,
    wait_id: WaitId,
}

/// The session actor.
pub struct SessionHandler<T: SocketTransport> {
    config: ZenithClientConfig,
    engine: ConnectionStateEngine,
    manager: ZenithSubscriptionManager,
    transport: T,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    cmd_rx: tokio::sync::mpsc::UnboundedReceiver<ClientCommand>,
    transport_rx: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    auth_fetch_tx:
        tokio::sync::mpsc::UnboundedSender<(WaitId, anyhow::Result<FetchedAccessToken>)>,
    auth_fetch_rx:
        tokio::sync::mpsc::UnboundedReceiver<(WaitId, anyhow::Result<FetchedAccessToken>)>,
    out_tx: tokio::sync::mpsc::UnboundedSender<SessionRecord>,
    online: Arc<AtomicBool>,
    cancel: CancellationToken,
    pending_auth: Option<PendingAuthExchange>,
    counters_due: Instant,
    cancel_handled: bool,
    cmd_closed: bool,
}

impl<T: SocketTransport> std::fmt::Debug for SessionHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("state", &self.engine.state())
            .field("subscriptions", &self.manager.registry().len())
            .finish_non_exhaustive()
    }
}

impl<T: SocketTransport> SessionHandler<T> {
    /// Creates a session actor.
    #[must_use]
    pub fn new(
        config: ZenithClientConfig,
        transport: T,
        transport_rx: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
        token_provider: Option<Arc<dyn AccessTokenProvider>>,
        cmd_rx: tokio::sync::mpsc::UnboundedReceiver<ClientCommand>,
        out_tx: tokio::sync::mpsc::UnboundedSender<SessionRecord>,
        online: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        let manager = ZenithSubscriptionManager::new(
            Duration::from_millis(config.response_timeout_ms),
            config.max_send_batch,
            config.message_log_level,
        );
        let (auth_fetch_tx, auth_fetch_rx) = tokio::sync::mpsc::unbounded_channel();
        let counters_due = Instant::now() + Duration::from_millis(config.counters_interval_ms);
        Self {
            config,
            engine: ConnectionStateEngine::new(),
            manager,
            transport,
            token_provider,
            cmd_rx,
            transport_rx,
            auth_fetch_tx,
            auth_fetch_rx,
            out_tx,
            online,
            cancel,
            pending_auth: None,
            counters_due,
            cancel_handled: false,
            cmd_closed: false,
        }
    }

    /// Runs the actor until the engine finalises.
    pub async fn run(mut self) {
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        loop {
            self.settle().await;

            if self.engine.state() == EngineState::Finalised {
                self.manager.finalise();
                self.settle().await;
                break;
            }

            let mut wake = Instant::now() + tick;
            if let Some(deadline) = self.engine.next_deadline() {
                wake = wake.min(deadline);
            }
            wake = wake.min(self.counters_due);

            tokio::select! {
                _ = self.cancel.cancelled(), if !self.cancel_handled => {
                    self.cancel_handled = true;
                    self.engine.finalise(false, Instant::now());
                }
                maybe_cmd = self.cmd_rx.recv(), if !self.cmd_closed => {
                    match maybe_cmd {
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            // Facade dropped; wind down.
                            self.cmd_closed = true;
                            self.engine.finalise(false, Instant::now());
                        }
                    }
                }
                Some(event) = self.transport_rx.recv() => {
                    self.on_transport_event(event);
                }
                Some((wait_id, result)) = self.auth_fetch_rx.recv() => {
                    self.on_access_token_result(wait_id, result);
                }
                _ = tokio::time::sleep_until(wake.into()) => {
                    self.on_timer().await;
                }
            }
        }
        tracing::debug!("Session actor stopped");
    }

    /// Processes pending engine events, auth frames and records until the
    /// system is quiescent.
    async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.engine.pop_event() {
                progressed = true;
                self.on_engine_event(event).await;
            }
            while let Some(frame) = self.manager.pop_auth_frame() {
                progressed = true;
                self.on_auth_frame(frame);
            }
            while let Some(record) = self.manager.pop_record() {
                let _ = self.out_tx.send(record);
            }
            if !progressed {
                break;
            }
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        self.engine.handle_deadline(now);

        let frames = self.manager.tick(now);
        for frame in frames {
            if let Err(e) = self.transport.send(frame).await {
                // The close event that follows drives the reconnect.
                tracing::warn!("Send failed: {e}");
                break;
            }
        }

        if now >= self.counters_due {
            self.emit_counters();
            self.counters_due = now + Duration::from_millis(self.config.counters_interval_ms);
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        let now = Instant::now();
        match command {
            ClientCommand::Connect => self.engine.advise_connection_subscription(
                self.config.endpoint.clone(),
                self.config.credentials.scheme(),
                now,
            ),
            ClientCommand::Close => self.engine.finalise(false, now),
            ClientCommand::Subscribe { id, definition } => self.manager.subscribe(id, definition),
            ClientCommand::SubscribeDeferred { id, definition } => {
                self.manager.subscribe_deferred(id, definition);
            }
            ClientCommand::Activate { id, request_nr } => self.manager.activate(id, request_nr),
            ClientCommand::Unsubscribe { id } => self.manager.unsubscribe(id),
            ClientCommand::NoteSubscribability(level) => self.manager.note_subscribability(level),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            // Open success is advised when `open()` returns.
            TransportEvent::Opened => {}
            TransportEvent::Message(text) => self.manager.buffer_frame(text),
            TransportEvent::Closed {
                code,
                reason,
                clean,
            } => {
                self.pending_auth = None;
                self.engine
                    .advise_socket_close(code, reason, clean, Instant::now());
            }
            TransportEvent::Error(text) => {
                tracing::warn!("Transport error: {text}");
            }
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Action(action) => match action {
                EngineAction::AuthTokenFetch => self.start_access_token_fetch(),
                EngineAction::AuthOwnerFetch => self.complete_owner_fetch(),
                EngineAction::SocketOpen => self.open_transport().await,
                EngineAction::ZenithTokenFetch | EngineAction::ZenithTokenRefresh => {
                    self.send_session_token_request().await;
                }
                EngineAction::SocketClose => self.close_transport().await,
                EngineAction::ConnectPending
                | EngineAction::Connect
                | EngineAction::ZenithTokenInterval
                | EngineAction::ReconnectDelay
                | EngineAction::Finalise => {}
            },
            EngineEvent::StateChanged(state) => {
                let _ = self.out_tx.send(SessionRecord::StateChanged { state });
            }
            EngineEvent::CameOnline => {
                self.online.store(true, Ordering::Release);
                self.manager.come_online();
                let _ = self.out_tx.send(SessionRecord::OnlineChanged {
                    online: true,
                    close_code: None,
                    close_reason: None,
                    clean: true,
                });
            }
            EngineEvent::WentOffline {
                close_code,
                close_reason,
                clean,
            } => {
                self.online.store(false, Ordering::Release);
                self.manager.go_offline();
                let _ = self.out_tx.send(SessionRecord::OnlineChanged {
                    online: false,
                    close_code,
                    close_reason,
                    clean,
                });
            }
            EngineEvent::Reconnect(reason) => {
                let _ = self.out_tx.send(SessionRecord::Reconnected { reason });
            }
            EngineEvent::SessionKickedOff => {
                let _ = self.out_tx.send(SessionRecord::SessionKickedOff);
            }
            EngineEvent::Log(text) => {
                let _ = self.out_tx.send(SessionRecord::LogLine(text));
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Auth flows
    // --------------------------------------------------------------------------------------------

    fn start_access_token_fetch(&mut self) {
        let wait_id = self.engine.wait_id();
        let Some(provider) = self.token_provider.clone() else {
            tracing::error!("Token auth selected but no access-token provider configured");
            self.engine.advise_auth_fetch_failure(wait_id, Instant::now());
            return;
        };
        let tx = self.auth_fetch_tx.clone();
        // One outstanding fetch per fencing token generation; a stale
        // completion is discarded by the engine.
        tokio::spawn(async move {
            let result = provider.fetch_access_token().await;
            let _ = tx.send((wait_id, result));
        });
    }

    fn on_access_token_result(
        &mut self,
        wait_id: WaitId,
        result: anyhow::Result<FetchedAccessToken>,
    ) {
        let now = Instant::now();
        match result {
            Ok(token) => {
                let expires_at = now + token.expires_in;
                self.engine
                    .advise_auth_token_fetch_success(wait_id, token.token, expires_at, now);
            }
            Err(e) => {
                let _ = self
                    .out_tx
                    .send(SessionRecord::LogLine(format!("access token fetch failed: {e}")));
                self.engine.advise_auth_fetch_failure(wait_id, now);
            }
        }
    }

    fn complete_owner_fetch(&mut self) {
        let wait_id = self.engine.wait_id();
        let now = Instant::now();
        match &self.config.credentials {
            SessionCredentials::Owner(_) => {
                self.engine.advise_auth_owner_fetch_success(wait_id, now);
            }
            SessionCredentials::Token { .. } => {
                tracing::error!("Owner auth stage entered without owner credentials");
                self.engine.advise_auth_fetch_failure(wait_id, now);
            }
        }
    }

    async fn send_session_token_request(&mut self) {
        let wait_id = self.engine.wait_id();
        let now = Instant::now();
        let transaction_id = self.manager.next_transaction_id();

        let envelope = match &self.config.credentials {
            SessionCredentials::Token { provider } => {
                let Some(cached) = self.engine.access_token() else {
                    self.fail_session_token(wait_id, "no cached access token", now);
                    return;
                };
                build_token_fetch(transaction_id, provider, &cached.token)
            }
            SessionCredentials::Owner(credentials) => {
                build_owner_fetch(transaction_id, credentials)
            }
        };

        let frame = match envelope.and_then(|env| {
            serde_json::to_string(&env).map_err(|e| crate::error::ZenithWsError::Json(e.to_string()))
        }) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail_session_token(wait_id, &e.to_string(), now);
                return;
            }
        };

        self.pending_auth = Some(PendingAuthExchange {
            transaction_id,
            wait_id,
        });
        if let Err(e) = self.transport.send(frame).await {
            self.pending_auth = None;
            self.fail_session_token(wait_id, &e.to_string(), Instant::now());
        }
    }

    fn on_auth_frame(&mut self, envelope: crate::messages::ZenithEnvelope) {
        let now = Instant::now();
        let Some(pending) = self.pending_auth else {
            tracing::debug!("Auth frame received with no outstanding exchange");
            return;
        };
        if envelope.transaction_id != Some(pending.transaction_id) {
            tracing::debug!("Auth frame from a previous token generation; discarding");
            return;
        }
        self.pending_auth = None;

        let refreshing = self.engine.state() == EngineState::ZenithTokenRefresh;
        match serde_json::from_value::<AuthReply>(envelope.data) {
            Ok(reply) if reply.is_success() => {
                let expires_in = Duration::from_secs(reply.expires_in);
                let _ = self.out_tx.send(SessionRecord::LogLine(format!(
                    "session authenticated: {} ({})",
                    reply.display_name, reply.user_id,
                )));
                if refreshing {
                    self.engine
                        .advise_zenith_token_refresh_success(pending.wait_id, expires_in, now);
                } else {
                    self.engine
                        .advise_zenith_token_fetch_success(pending.wait_id, expires_in, now);
                }
            }
            Ok(reply) => {
                let _ = self.out_tx.send(SessionRecord::LogLine(format!(
                    "authentication rejected: {}",
                    reply.result,
                )));
                if refreshing {
                    self.engine
                        .advise_zenith_token_refresh_failure(pending.wait_id, now);
                } else {
                    // Rejected owner credentials are unrecoverable.
                    let finalise =
                        self.config.credentials.scheme() == AuthScheme::AuthOwner;
                    self.engine
                        .advise_zenith_token_fetch_failure(pending.wait_id, finalise, now);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to parse auth reply: {e}");
                if refreshing {
                    self.engine
                        .advise_zenith_token_refresh_failure(pending.wait_id, now);
                } else {
                    self.engine
                        .advise_zenith_token_fetch_failure(pending.wait_id, false, now);
                }
            }
        }
    }

    fn fail_session_token(&mut self, wait_id: WaitId, reason: &str, now: Instant) {
        let _ = self.out_tx.send(SessionRecord::LogLine(format!(
            "session token exchange failed: {reason}",
        )));
        if self.engine.state() == EngineState::ZenithTokenRefresh {
            self.engine.advise_zenith_token_refresh_failure(wait_id, now);
        } else {
            self.engine
                .advise_zenith_token_fetch_failure(wait_id, false, now);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Transport
    // --------------------------------------------------------------------------------------------

    async fn open_transport(&mut self) {
        let wait_id = self.engine.wait_id();
        let endpoint = self
            .engine
            .active_target()
            .map_or_else(|| self.config.endpoint.clone(), |t| t.endpoint.clone());

        match self.transport.open(&endpoint).await {
            Ok(()) => {
                self.engine
                    .advise_socket_open_success(wait_id, Instant::now());
            }
            Err(e) => {
                let _ = self
                    .out_tx
                    .send(SessionRecord::LogLine(format!("socket open failed: {e}")));
                self.engine
                    .advise_socket_open_failure(wait_id, Instant::now());
            }
        }
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.transport.close(1000, "session closing").await {
            // Treat an unwritable socket as already closed.
            tracing::debug!("Close request failed: {e}");
            self.engine
                .advise_socket_close(None, None, false, Instant::now());
        }
    }

    fn emit_counters(&mut self) {
        let (auth_fetch_failures, socket_open_failures, token_fetch_failures, refresh_failures, unexpected_closes) =
            self.engine.failure_counters();
        let (frames_sent, frames_received) = self.manager.frame_counts();
        let snapshot = CountersSnapshot {
            frames_sent,
            frames_received,
            auth_fetch_failures,
            socket_open_failures,
            token_fetch_failures,
            refresh_failures,
            unexpected_closes,
            errors: self.manager.take_error_counts(),
        };
        let _ = self.out_tx.send(SessionRecord::Counters(snapshot));
    }
}
