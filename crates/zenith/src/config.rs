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

//! Configuration for the Zenith client.

use crate::{auth::SessionCredentials, common::enums::MessageLogLevel};

/// Static configuration for one client instance.
#[derive(Clone, Debug)]
pub struct ZenithClientConfig {
    /// WebSocket endpoint of the publisher.
    pub endpoint: String,
    /// Credentials selecting the auth flow.
    pub credentials: SessionCredentials,
    /// Response deadline (ms) armed on each transmitted request.
    pub response_timeout_ms: u64,
    /// Scheduling tick interval (ms).
    pub tick_interval_ms: u64,
    /// Period (ms) between counters snapshots.
    pub counters_interval_ms: u64,
    /// Maximum requests flushed from the send queue per tick.
    pub max_send_batch: usize,
    /// Tiered protocol-message logging.
    pub message_log_level: MessageLogLevel,
}

impl ZenithClientConfig {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, credentials: SessionCredentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            response_timeout_ms: 30_000,
            tick_interval_ms: 200,
            counters_interval_ms: 60_000,
            max_send_batch: 20,
            message_log_level: MessageLogLevel::Off,
        }
    }
}
