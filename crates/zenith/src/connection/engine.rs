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

//! Connection lifecycle state machine.
//!
//! The engine drives the authenticate/open/refresh/close/reconnect cycle as a
//! fenced state machine. Every transition mints a new fencing token
//! ([`WaitId`]); an `advise_*` call or timer completion whose token no longer
//! matches the current one is a guaranteed no-op, which is what makes the
//! single-writer scheduling model safe without locks.
//!
//! The engine performs no I/O itself: it emits [`EngineEvent`]s that the
//! orchestrator translates into transport, auth-provider and wire operations.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use strum::{AsRefStr, Display};

use crate::common::{
    consts::{
        ACCESS_TOKEN_REUSE_MARGIN_MS, AUTH_TOKEN_FETCH_TIMEOUT_MS, IMMEDIATE_RECONNECT_DELAY_MS,
        SESSION_KICKED_OFF_CLOSE_CODE, SOCKET_CLOSE_TIMEOUT_MS, SOCKET_OPEN_TIMEOUT_MS,
        TOKEN_REFRESH_MARGIN_MS, TOKEN_REFRESH_TIGHTENED_MARGIN_MS, ZENITH_TOKEN_FETCH_TIMEOUT_MS,
        ZENITH_TOKEN_REFRESH_TIMEOUT_MS,
    },
    enums::AuthScheme,
};

/// Fencing token minted on every engine transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WaitId(pub u64);

/// Lifecycle states of the connection engine.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, AsRefStr)]
pub enum EngineState {
    /// Idle, awaiting a connect request.
    ConnectionSubscription,
    /// Backing off before the next connect attempt.
    ReconnectDelay,
    ConnectPending,
    Connect,
    AuthFetch,
    SocketOpen,
    ZenithTokenFetch,
    /// Online; waiting for the token refresh interval to elapse.
    ZenithTokenInterval,
    ZenithTokenRefresh,
    SocketClose,
    /// Terminal.
    Finalised,
}

/// Actions taken by the engine, some of which require orchestrator work.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, AsRefStr)]
pub enum EngineAction {
    ConnectPending,
    Connect,
    /// Fetch a bearer access token from the external provider.
    AuthTokenFetch,
    /// Package the stored owner credentials.
    AuthOwnerFetch,
    /// Open the transport towards the active endpoint.
    SocketOpen,
    /// Send the Zenith token fetch exchange over the socket.
    ZenithTokenFetch,
    ZenithTokenInterval,
    /// Send the Zenith token refresh exchange over the socket.
    ZenithTokenRefresh,
    /// Close the transport.
    SocketClose,
    ReconnectDelay,
    Finalise,
}

/// Reasons the engine schedules a reconnect.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, AsRefStr)]
pub enum ReconnectReason {
    /// A new connection subscription arrived while a session was active.
    ConnectionSubscription,
    /// The external access-token fetch failed.
    TokenFailure,
    SocketOpenFailure,
    /// The Zenith token fetch failed.
    TokenFetchFailure,
    UnexpectedSocketClose,
}

/// Connect target recorded by a connection subscription.
#[derive(Clone, Debug)]
pub struct ConnectTarget {
    pub endpoint: String,
    pub scheme: AuthScheme,
}

/// Externally fetched bearer token cached for reconnect reuse.
#[derive(Clone)]
pub struct CachedAccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl std::fmt::Debug for CachedAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedAccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Side effects raised to the orchestrator.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Action(EngineAction),
    StateChanged(EngineState),
    CameOnline,
    WentOffline {
        close_code: Option<u16>,
        close_reason: Option<String>,
        clean: bool,
    },
    Reconnect(ReconnectReason),
    /// The server terminated the session with the reserved close code.
    SessionKickedOff,
    Log(String),
}

fn auth_fetch_delay(failures: u32) -> Duration {
    let millis = match failures {
        0 | 1 => 2_000,
        2..=4 => 5_000,
        5..=8 => 30_000,
        _ => 60_000,
    };
    Duration::from_millis(millis)
}

fn socket_open_delay(failures: u32) -> Duration {
    let millis = match failures {
        0 | 1 => 50,
        2..=8 => 2_000,
        9..=11 => 10_000,
        _ => 15_000,
    };
    Duration::from_millis(millis)
}

fn token_fetch_delay(failures: u32) -> Duration {
    let millis = match failures {
        0 | 1 => 2_000,
        2..=8 => 5_000,
        9..=11 => 30_000,
        _ => 60_000,
    };
    Duration::from_millis(millis)
}

/// The connection lifecycle state machine.
#[derive(Debug)]
pub struct ConnectionStateEngine {
    state: EngineState,
    wait_id: WaitId,
    deadline: Option<Instant>,
    auth_fetch_failures: u32,
    socket_open_failures: u32,
    token_fetch_failures: u32,
    refresh_failures: u32,
    unexpected_closes: u32,
    pending_target: Option<ConnectTarget>,
    active_target: Option<ConnectTarget>,
    access_token: Option<CachedAccessToken>,
    zenith_expiry: Option<Instant>,
    socket_open: bool,
    online: bool,
    finalising: bool,
    reconnect_pending: Option<ReconnectReason>,
    events: VecDeque<EngineEvent>,
}

impl Default for ConnectionStateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateEngine {
    /// Creates an idle engine awaiting a connection subscription.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: EngineState::ConnectionSubscription,
            wait_id: WaitId(0),
            deadline: None,
            auth_fetch_failures: 0,
            socket_open_failures: 0,
            token_fetch_failures: 0,
            refresh_failures: 0,
            unexpected_closes: 0,
            pending_target: None,
            active_target: None,
            access_token: None,
            zenith_expiry: None,
            socket_open: false,
            online: false,
            finalising: false,
            reconnect_pending: None,
            events: VecDeque::new(),
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Returns the current fencing token.
    #[must_use]
    pub fn wait_id(&self) -> WaitId {
        self.wait_id
    }

    /// Returns whether the session is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Returns the active connect target.
    #[must_use]
    pub fn active_target(&self) -> Option<&ConnectTarget> {
        self.active_target.as_ref()
    }

    /// Returns the cached external access token.
    #[must_use]
    pub fn access_token(&self) -> Option<&CachedAccessToken> {
        self.access_token.as_ref()
    }

    /// Returns the armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the consecutive failure counters
    /// (auth-fetch, socket-open, token-fetch, refresh, unexpected-close).
    #[must_use]
    pub fn failure_counters(&self) -> (u32, u32, u32, u32, u32) {
        (
            self.auth_fetch_failures,
            self.socket_open_failures,
            self.token_fetch_failures,
            self.refresh_failures,
            self.unexpected_closes,
        )
    }

    /// Pops the next pending side-effect event.
    pub fn pop_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Drains all pending side-effect events.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    // --------------------------------------------------------------------------------------------
    // Advise operations (all fenced)
    // --------------------------------------------------------------------------------------------

    /// Records a new connect target.
    ///
    /// From idle this starts the connect sequence; with a session in any other
    /// stage it forces a reconnect so the new target takes over.
    pub fn advise_connection_subscription(
        &mut self,
        endpoint: String,
        scheme: AuthScheme,
        now: Instant,
    ) {
        if self.state == EngineState::Finalised {
            return;
        }
        self.pending_target = Some(ConnectTarget { endpoint, scheme });
        if self.state == EngineState::ConnectionSubscription {
            self.begin_connect(now);
        } else {
            self.start_reconnect(ReconnectReason::ConnectionSubscription, now);
        }
    }

    /// Reports a successful external access-token fetch.
    pub fn advise_auth_token_fetch_success(
        &mut self,
        wait_id: WaitId,
        token: String,
        expires_at: Instant,
        now: Instant,
    ) {
        if !self.fence(EngineState::AuthFetch, wait_id) {
            return;
        }
        self.access_token = Some(CachedAccessToken { token, expires_at });
        self.auth_fetch_failures = 0;
        self.enter_socket_open(now);
    }

    /// Reports that the owner credentials were packaged successfully.
    pub fn advise_auth_owner_fetch_success(&mut self, wait_id: WaitId, now: Instant) {
        if !self.fence(EngineState::AuthFetch, wait_id) {
            return;
        }
        self.auth_fetch_failures = 0;
        self.enter_socket_open(now);
    }

    /// Reports a failed authentication fetch.
    ///
    /// Token-scheme failures reconnect; owner-scheme failures finalise because
    /// the stored credentials are presumed invalid.
    pub fn advise_auth_fetch_failure(&mut self, wait_id: WaitId, now: Instant) {
        if !self.fence(EngineState::AuthFetch, wait_id) {
            return;
        }
        self.auth_fetch_failed(now);
    }

    /// Reports that the transport opened.
    pub fn advise_socket_open_success(&mut self, wait_id: WaitId, now: Instant) {
        if !self.fence(EngineState::SocketOpen, wait_id) {
            return;
        }
        self.socket_open = true;
        self.socket_open_failures = 0;
        self.transition(
            EngineState::ZenithTokenFetch,
            EngineAction::ZenithTokenFetch,
            Some(Duration::from_millis(ZENITH_TOKEN_FETCH_TIMEOUT_MS)),
            now,
        );
    }

    /// Reports that the transport failed to open.
    pub fn advise_socket_open_failure(&mut self, wait_id: WaitId, now: Instant) {
        if !self.fence(EngineState::SocketOpen, wait_id) {
            return;
        }
        self.socket_open_failed(now);
    }

    /// Reports a granted Zenith token: the session comes online.
    pub fn advise_zenith_token_fetch_success(
        &mut self,
        wait_id: WaitId,
        expires_in: Duration,
        now: Instant,
    ) {
        if !self.fence(EngineState::ZenithTokenFetch, wait_id) {
            return;
        }
        self.token_fetch_failures = 0;
        self.refresh_failures = 0;
        self.zenith_expiry = Some(now + expires_in);
        self.enter_token_interval(now);
        self.online = true;
        self.events.push_back(EngineEvent::CameOnline);
    }

    /// Reports a failed Zenith token fetch.
    pub fn advise_zenith_token_fetch_failure(
        &mut self,
        wait_id: WaitId,
        finalise: bool,
        now: Instant,
    ) {
        if !self.fence(EngineState::ZenithTokenFetch, wait_id) {
            return;
        }
        if finalise {
            self.finalise(false, now);
        } else {
            self.token_fetch_failed(now);
        }
    }

    /// Reports a refreshed Zenith token.
    pub fn advise_zenith_token_refresh_success(
        &mut self,
        wait_id: WaitId,
        expires_in: Duration,
        now: Instant,
    ) {
        if !self.fence(EngineState::ZenithTokenRefresh, wait_id) {
            return;
        }
        self.refresh_failures = 0;
        self.zenith_expiry = Some(now + expires_in);
        self.enter_token_interval(now);
    }

    /// Reports a failed Zenith token refresh.
    ///
    /// Refresh failures are tolerated: the cached expiry is cleared so the
    /// next interval performs a fresh fetch, and the engine recycles to the
    /// interval state.
    pub fn advise_zenith_token_refresh_failure(&mut self, wait_id: WaitId, now: Instant) {
        if !self.fence(EngineState::ZenithTokenRefresh, wait_id) {
            return;
        }
        self.refresh_failed(now);
    }

    /// Reports that the transport closed.
    pub fn advise_socket_close(
        &mut self,
        code: Option<u16>,
        reason: Option<String>,
        clean: bool,
        now: Instant,
    ) {
        if self.state == EngineState::Finalised {
            return;
        }
        self.socket_open = false;
        self.note_offline(code, reason, clean);

        if self.state == EngineState::SocketClose {
            // The engine itself requested this close.
            self.proceed_after_close(now);
            return;
        }

        if code == Some(SESSION_KICKED_OFF_CLOSE_CODE) {
            self.events.push_back(EngineEvent::SessionKickedOff);
            self.finalise(true, now);
            return;
        }

        self.unexpected_closes += 1;
        self.start_reconnect(ReconnectReason::UnexpectedSocketClose, now);
    }

    /// Reports that the reconnect backoff elapsed.
    pub fn advise_reconnect_delay_completed(&mut self, now: Instant) {
        if self.state != EngineState::ReconnectDelay {
            return;
        }
        self.reconnect_pending = None;
        if self.pending_target.is_some() {
            self.begin_connect(now);
            return;
        }
        if self.access_token_reusable(now) {
            self.enter_socket_open(now);
        } else {
            self.connect_again(now);
        }
    }

    /// Unconditional wind-down to `Finalised`, cancelling any armed timer.
    pub fn finalise(&mut self, socket_already_closed: bool, now: Instant) {
        if self.state == EngineState::Finalised {
            return;
        }
        self.deadline = None;
        self.finalising = true;
        if self.socket_open && !socket_already_closed {
            self.transition(
                EngineState::SocketClose,
                EngineAction::SocketClose,
                Some(Duration::from_millis(SOCKET_CLOSE_TIMEOUT_MS)),
                now,
            );
        } else {
            self.enter_finalised(now);
        }
    }

    /// Fires the armed deadline if it has elapsed.
    ///
    /// A deadline is implicitly fenced: transitions clear or re-arm it, so a
    /// stale timer can never observe a satisfied deadline here.
    pub fn handle_deadline(&mut self, now: Instant) {
        let Some(at) = self.deadline else {
            return;
        };
        if at > now {
            return;
        }
        self.deadline = None;

        match self.state {
            EngineState::ReconnectDelay => self.advise_reconnect_delay_completed(now),
            EngineState::ZenithTokenInterval => self.interval_elapsed(now),
            EngineState::AuthFetch => {
                self.log("access token fetch timed out");
                self.auth_fetch_failed(now);
            }
            EngineState::SocketOpen => {
                self.log("socket open timed out");
                self.socket_open_failed(now);
            }
            EngineState::ZenithTokenFetch => {
                self.log("Zenith token fetch timed out");
                self.token_fetch_failed(now);
            }
            EngineState::ZenithTokenRefresh => {
                self.log("Zenith token refresh timed out");
                self.refresh_failed(now);
            }
            EngineState::SocketClose => {
                // Close acknowledgement never arrived; treat as closed unclean.
                self.socket_open = false;
                self.note_offline(None, None, false);
                self.proceed_after_close(now);
            }
            _ => {}
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internal transitions
    // --------------------------------------------------------------------------------------------

    fn fence(&self, expected: EngineState, wait_id: WaitId) -> bool {
        self.state == expected && self.wait_id == wait_id
    }

    fn transition(
        &mut self,
        state: EngineState,
        action: EngineAction,
        timeout: Option<Duration>,
        now: Instant,
    ) {
        self.state = state;
        self.wait_id = WaitId(self.wait_id.0 + 1);
        self.deadline = timeout.map(|t| now + t);
        self.events.push_back(EngineEvent::Action(action));
        self.events.push_back(EngineEvent::StateChanged(state));
    }

    fn log(&mut self, text: &str) {
        self.events.push_back(EngineEvent::Log(text.to_string()));
    }

    fn begin_connect(&mut self, now: Instant) {
        self.transition(
            EngineState::ConnectPending,
            EngineAction::ConnectPending,
            None,
            now,
        );
        // A fresh connect target resets the failure history.
        if let Some(target) = self.pending_target.take() {
            self.active_target = Some(target);
        }
        self.auth_fetch_failures = 0;
        self.socket_open_failures = 0;
        self.token_fetch_failures = 0;
        self.refresh_failures = 0;
        self.unexpected_closes = 0;
        self.connect_again(now);
    }

    fn connect_again(&mut self, now: Instant) {
        self.transition(EngineState::Connect, EngineAction::Connect, None, now);
        self.enter_auth_fetch(now);
    }

    fn enter_auth_fetch(&mut self, now: Instant) {
        let scheme = self
            .active_target
            .as_ref()
            .map_or(AuthScheme::AuthToken, |t| t.scheme);
        match scheme {
            AuthScheme::AuthToken => self.transition(
                EngineState::AuthFetch,
                EngineAction::AuthTokenFetch,
                Some(Duration::from_millis(AUTH_TOKEN_FETCH_TIMEOUT_MS)),
                now,
            ),
            AuthScheme::AuthOwner => self.transition(
                EngineState::AuthFetch,
                EngineAction::AuthOwnerFetch,
                None,
                now,
            ),
        }
    }

    fn enter_socket_open(&mut self, now: Instant) {
        self.transition(
            EngineState::SocketOpen,
            EngineAction::SocketOpen,
            Some(Duration::from_millis(SOCKET_OPEN_TIMEOUT_MS)),
            now,
        );
    }

    fn enter_token_interval(&mut self, now: Instant) {
        let margin = if self.refresh_failures > 0 {
            Duration::from_millis(TOKEN_REFRESH_TIGHTENED_MARGIN_MS)
        } else {
            Duration::from_millis(TOKEN_REFRESH_MARGIN_MS)
        };
        let due = match self.zenith_expiry {
            Some(expiry) => expiry.checked_sub(margin).filter(|at| *at > now),
            None => None,
        };
        let wait = due.map_or(
            Duration::from_millis(TOKEN_REFRESH_TIGHTENED_MARGIN_MS),
            |at| at - now,
        );
        self.transition(
            EngineState::ZenithTokenInterval,
            EngineAction::ZenithTokenInterval,
            Some(wait),
            now,
        );
    }

    fn interval_elapsed(&mut self, now: Instant) {
        if self.zenith_expiry.is_some() {
            self.transition(
                EngineState::ZenithTokenRefresh,
                EngineAction::ZenithTokenRefresh,
                Some(Duration::from_millis(ZENITH_TOKEN_REFRESH_TIMEOUT_MS)),
                now,
            );
        } else {
            // A prior refresh failed; redo the full fetch over the live socket.
            self.transition(
                EngineState::ZenithTokenFetch,
                EngineAction::ZenithTokenFetch,
                Some(Duration::from_millis(ZENITH_TOKEN_FETCH_TIMEOUT_MS)),
                now,
            );
        }
    }

    fn auth_fetch_failed(&mut self, now: Instant) {
        self.auth_fetch_failures += 1;
        let scheme = self
            .active_target
            .as_ref()
            .map_or(AuthScheme::AuthToken, |t| t.scheme);
        if scheme == AuthScheme::AuthOwner {
            self.log("owner credential fetch failed; finalising");
            self.finalise(!self.socket_open, now);
        } else {
            self.start_reconnect(ReconnectReason::TokenFailure, now);
        }
    }

    fn socket_open_failed(&mut self, now: Instant) {
        self.socket_open_failures += 1;
        self.start_reconnect(ReconnectReason::SocketOpenFailure, now);
    }

    fn token_fetch_failed(&mut self, now: Instant) {
        self.token_fetch_failures += 1;
        self.start_reconnect(ReconnectReason::TokenFetchFailure, now);
    }

    fn refresh_failed(&mut self, now: Instant) {
        self.refresh_failures += 1;
        self.zenith_expiry = None;
        self.enter_token_interval(now);
    }

    fn start_reconnect(&mut self, reason: ReconnectReason, now: Instant) {
        self.events.push_back(EngineEvent::Reconnect(reason));
        self.reconnect_pending = Some(reason);
        if self.socket_open {
            self.transition(
                EngineState::SocketClose,
                EngineAction::SocketClose,
                Some(Duration::from_millis(SOCKET_CLOSE_TIMEOUT_MS)),
                now,
            );
        } else {
            self.enter_reconnect_delay(now);
        }
    }

    fn enter_reconnect_delay(&mut self, now: Instant) {
        let delay = self.reconnect_delay();
        match self.reconnect_pending {
            Some(reason) => {
                self.log(&format!("reconnect ({reason}) in {}ms", delay.as_millis()));
            }
            None => self.log(&format!("reconnect delay {}ms", delay.as_millis())),
        }
        self.transition(
            EngineState::ReconnectDelay,
            EngineAction::ReconnectDelay,
            Some(delay),
            now,
        );
    }

    /// Computes the reconnect delay from the first non-zero failure counter in
    /// priority order auth-fetch, socket-open, token-fetch.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        if self.auth_fetch_failures > 0 {
            auth_fetch_delay(self.auth_fetch_failures)
        } else if self.socket_open_failures > 0 {
            socket_open_delay(self.socket_open_failures)
        } else if self.token_fetch_failures > 0 {
            token_fetch_delay(self.token_fetch_failures)
        } else {
            Duration::from_millis(IMMEDIATE_RECONNECT_DELAY_MS)
        }
    }

    fn proceed_after_close(&mut self, now: Instant) {
        if self.finalising {
            self.enter_finalised(now);
        } else {
            self.enter_reconnect_delay(now);
        }
    }

    fn enter_finalised(&mut self, now: Instant) {
        self.note_offline(None, None, true);
        self.reconnect_pending = None;
        self.transition(EngineState::Finalised, EngineAction::Finalise, None, now);
        self.deadline = None;
    }

    fn note_offline(&mut self, code: Option<u16>, reason: Option<String>, clean: bool) {
        if self.online {
            self.online = false;
            self.events.push_back(EngineEvent::WentOffline {
                close_code: code,
                close_reason: reason,
                clean,
            });
        }
    }

    fn access_token_reusable(&self, now: Instant) -> bool {
        self.access_token.as_ref().is_some_and(|token| {
            token.expires_at > now + Duration::from_millis(ACCESS_TOKEN_REUSE_MARGIN_MS)
        })
    }
}
