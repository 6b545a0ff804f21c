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

//! Zenith client error types.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error types for the Zenith client.
#[derive(Debug, Clone, Error)]
pub enum ZenithWsError {
    /// Client is not connected.
    #[error("Not connected")]
    NotConnected,
    /// Transport-level error during WebSocket communication.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Failed to send a frame over the socket.
    #[error("Send error: {0}")]
    Send(String),
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
    /// Authentication failed.
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// Generic client error.
    #[error("Client error: {0}")]
    ClientError(String),
    /// Request timeout.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<tungstenite::Error> for ZenithWsError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for ZenithWsError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

/// Result type alias for Zenith client operations.
pub type ZenithWsResult<T> = Result<T, ZenithWsError>;

/// Determines if a client-level error should trigger a retry.
#[must_use]
pub fn should_retry_ws_error(error: &ZenithWsError) -> bool {
    matches!(
        error,
        ZenithWsError::Transport(_)
            | ZenithWsError::Send(_)
            | ZenithWsError::NotConnected
            | ZenithWsError::Timeout(_)
    )
}
