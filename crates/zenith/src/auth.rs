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

//! Session credentials and the external access-token seam.
//!
//! The bearer-token flow fetches its access token from an injected
//! [`AccessTokenProvider`] before the socket opens; the owner flow packages
//! stored credentials locally. Both then exchange a Zenith token over the
//! socket via the `Auth` controller.

use std::time::Duration;

use async_trait::async_trait;
use ustr::Ustr;

use crate::{
    common::{
        consts::{AUTH_CONTROLLER, AUTH_OWNER_TOPIC, AUTH_TOKEN_TOPIC},
        enums::{AuthScheme, MessageAction},
    },
    error::{ZenithWsError, ZenithWsResult},
    messages::{AuthOwnerRequest, AuthTokenRequest, ZenithEnvelope},
};

/// Externally fetched bearer access token.
#[derive(Clone)]
pub struct FetchedAccessToken {
    pub token: String,
    pub expires_in: Duration,
}

impl std::fmt::Debug for FetchedAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedAccessToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Seam to the external identity provider for the bearer-token flow.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Fetches a fresh access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request or is unreachable.
    async fn fetch_access_token(&self) -> anyhow::Result<FetchedAccessToken>;
}

/// Owner (username/password) credentials.
#[derive(Clone)]
pub struct OwnerCredentials {
    pub provider: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for OwnerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerCredentials")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials selecting one of the two mutually exclusive auth flows.
#[derive(Clone, Debug)]
pub enum SessionCredentials {
    /// Bearer token fetched from an [`AccessTokenProvider`].
    Token { provider: String },
    /// Stored owner credentials.
    Owner(OwnerCredentials),
}

impl SessionCredentials {
    /// Returns the auth scheme these credentials select.
    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Self::Token { .. } => AuthScheme::AuthToken,
            Self::Owner(_) => AuthScheme::AuthOwner,
        }
    }
}

/// Builds the Zenith token fetch envelope for the bearer-token flow.
///
/// # Errors
///
/// Returns an error if the request payload cannot be serialized.
pub fn build_token_fetch(
    transaction_id: u64,
    provider: &str,
    access_token: &str,
) -> ZenithWsResult<ZenithEnvelope> {
    let request = AuthTokenRequest {
        provider: provider.to_string(),
        access_token: access_token.to_string(),
    };
    let data = serde_json::to_value(request).map_err(|e| ZenithWsError::Json(e.to_string()))?;
    Ok(ZenithEnvelope::new(
        Ustr::from(AUTH_CONTROLLER),
        Ustr::from(AUTH_TOKEN_TOPIC),
        MessageAction::Publish,
        Some(transaction_id),
        data,
    ))
}

/// Builds the Zenith token fetch envelope for the owner flow.
///
/// # Errors
///
/// Returns an error if the request payload cannot be serialized.
pub fn build_owner_fetch(
    transaction_id: u64,
    credentials: &OwnerCredentials,
) -> ZenithWsResult<ZenithEnvelope> {
    let request = AuthOwnerRequest {
        provider: credentials.provider.clone(),
        client_id: credentials.client_id.clone(),
        username: credentials.username.clone(),
        password: credentials.password.clone(),
    };
    let data = serde_json::to_value(request).map_err(|e| ZenithWsError::Json(e.to_string()))?;
    Ok(ZenithEnvelope::new(
        Ustr::from(AUTH_CONTROLLER),
        Ustr::from(AUTH_OWNER_TOPIC),
        MessageAction::Publish,
        Some(transaction_id),
        data,
    ))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_token_fetch_envelope_shape() {
        let env = build_token_fetch(3, "Paritech", "bearer-token").unwrap();
        assert_eq!(env.controller.as_str(), "Auth");
        assert_eq!(env.topic.as_str(), "AuthToken");
        assert_eq!(env.transaction_id, Some(3));
        assert_eq!(env.data["accessToken"], "bearer-token");
    }

    #[rstest]
    fn test_owner_fetch_envelope_shape() {
        let credentials = OwnerCredentials {
            provider: "Paritech".to_string(),
            client_id: "client".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let env = build_owner_fetch(4, &credentials).unwrap();
        assert_eq!(env.topic.as_str(), "AuthOwner");
        assert_eq!(env.data["clientId"], "client");
        assert_eq!(env.data["password"], "pass");
    }

    #[rstest]
    fn test_credentials_debug_redacts_password() {
        let credentials = SessionCredentials::Owner(OwnerCredentials {
            provider: "p".to_string(),
            client_id: "c".to_string(),
            username: "u".to_string(),
            password: "hunter2".to_string(),
        });
        assert!(!format!("{credentials:?}").contains("hunter2"));
        assert_eq!(credentials.scheme(), AuthScheme::AuthOwner);
    }
}
