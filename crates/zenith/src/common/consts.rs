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

//! Wire-level constants for the Zenith protocol.

/// Controller carrying the authentication sub-protocol.
pub const AUTH_CONTROLLER: &str = "Auth";

/// Topic for the bearer-token authentication flow.
pub const AUTH_TOKEN_TOPIC: &str = "AuthToken";

/// Topic for the owner-credential authentication flow.
pub const AUTH_OWNER_TOPIC: &str = "AuthOwner";

/// Close code the server uses when the session has been taken over elsewhere.
///
/// A close with this code is unrecoverable: the engine finalises and never
/// reconnects. Every other close code is treated as transient.
pub const SESSION_KICKED_OFF_CLOSE_CODE: u16 = 4000;

/// Timeout (ms) for the external access-token fetch stage.
pub const AUTH_TOKEN_FETCH_TIMEOUT_MS: u64 = 20_000;

/// Timeout (ms) for opening the socket.
pub const SOCKET_OPEN_TIMEOUT_MS: u64 = 40_000;

/// Timeout (ms) for the Zenith token fetch exchange.
pub const ZENITH_TOKEN_FETCH_TIMEOUT_MS: u64 = 40_000;

/// Timeout (ms) for the Zenith token refresh exchange.
pub const ZENITH_TOKEN_REFRESH_TIMEOUT_MS: u64 = 40_000;

/// Timeout (ms) for a requested socket close to be acknowledged.
pub const SOCKET_CLOSE_TIMEOUT_MS: u64 = 5_000;

/// Margin (ms) before Zenith token expiry at which a refresh is scheduled.
pub const TOKEN_REFRESH_MARGIN_MS: u64 = 120_000;

/// Tightened refresh margin (ms) applied after consecutive refresh failures.
pub const TOKEN_REFRESH_TIGHTENED_MARGIN_MS: u64 = 60_000;

/// Minimum remaining lifetime (ms) for a cached access token to be reused
/// across a reconnect without redoing the full connect stage.
pub const ACCESS_TOKEN_REUSE_MARGIN_MS: u64 = 60_000;

/// Reconnect delay (ms) when no failure counter is non-zero.
pub const IMMEDIATE_RECONNECT_DELAY_MS: u64 = 50;
