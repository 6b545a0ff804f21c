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

//! Data structures for Zenith wire envelopes and the authentication flows.

use serde::{Deserialize, Serialize};
use ustr::Ustr;

use crate::{
    common::enums::{MessageAction, ZenithErrorKind},
    error::ZenithWsError,
};

/// Zenith protocol envelope.
///
/// Every frame in both directions is one envelope. The `action` field may be
/// omitted on the wire; [`ZenithEnvelope::action`] applies the inference rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZenithEnvelope {
    /// Controller name (e.g. "Trades", "Market", "Auth").
    pub controller: Ustr,
    /// Topic within the controller (e.g. "AAPL.XASX").
    pub topic: Ustr,
    /// Action discriminator; absent on some inbound frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<MessageAction>,
    /// Transaction id assigned at send time for Publish requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,
    /// Set on the initial acknowledgement of a Sub (and, erroneously, Unsub).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
    /// Action-specific payload, opaque to this engine.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl ZenithEnvelope {
    /// Creates an outbound envelope.
    #[must_use]
    pub fn new(
        controller: Ustr,
        topic: Ustr,
        action: MessageAction,
        transaction_id: Option<u64>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            controller,
            topic,
            action: Some(action),
            transaction_id,
            confirm: None,
            data,
        }
    }

    /// Returns the effective action, inferring `Publish` when a transaction id
    /// is present and `Sub` otherwise.
    #[must_use]
    pub fn action(&self) -> MessageAction {
        self.action.unwrap_or(if self.transaction_id.is_some() {
            MessageAction::Publish
        } else {
            MessageAction::Sub
        })
    }

    /// Returns whether the envelope confirms a request.
    #[must_use]
    pub fn is_confirm(&self) -> bool {
        self.confirm == Some(true)
    }
}

/// Error detail a reply payload may carry under its `error` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Wire error code, mapping onto [`ZenithErrorKind`].
    pub code: Option<String>,
    /// Human-readable detail.
    pub message: Option<String>,
    /// Explicit server permission to retransmit.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorPayload {
    /// Maps the wire code onto a classified kind, if recognised.
    #[must_use]
    pub fn kind(&self) -> Option<ZenithErrorKind> {
        self.code.as_deref().and_then(|c| c.parse().ok())
    }

    /// Returns the message text, falling back to the code.
    #[must_use]
    pub fn text(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "unspecified error".to_string())
    }
}

/// Extracts the error detail from a reply payload, if present.
#[must_use]
pub fn extract_error(data: &serde_json::Value) -> Option<ErrorPayload> {
    let error = data.get("error")?;
    serde_json::from_value(error.clone()).ok()
}

/// Bearer-token authentication request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenRequest {
    /// Identity provider name.
    pub provider: String,
    /// Externally fetched access token.
    pub access_token: String,
}

/// Owner-credential authentication request payload.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOwnerRequest {
    /// Identity provider name.
    pub provider: String,
    /// Registered client id.
    pub client_id: String,
    /// Account username.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl std::fmt::Debug for AuthOwnerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOwnerRequest")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reply payload for both authentication flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthReply {
    /// "Success" on a granted session.
    pub result: String,
    /// Session (Zenith) access token.
    pub access_token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Authenticated user id.
    #[serde(default)]
    pub user_id: String,
    /// Display name of the authenticated user.
    #[serde(default)]
    pub display_name: String,
    /// Granted scope.
    #[serde(default)]
    pub scope: String,
}

impl AuthReply {
    /// Returns whether the authentication exchange succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.eq_ignore_ascii_case("success")
    }
}

/// Parses one raw text frame into an envelope.
///
/// # Errors
///
/// Returns an error if the frame is not valid JSON or lacks envelope fields.
pub fn parse_frame(text: &str) -> Result<ZenithEnvelope, ZenithWsError> {
    serde_json::from_str(text).map_err(|e| ZenithWsError::Json(e.to_string()))
}
