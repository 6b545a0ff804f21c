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

//! Records emitted to the owning layer.

use serde::{Deserialize, Serialize};

use crate::{
    common::enums::{AllowedRetry, ZenithErrorKind},
    connection::{EngineState, ReconnectReason},
    messages::ZenithEnvelope,
    subscription::registry::SubscriptionId,
};

/// Periodic operational counters snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub auth_fetch_failures: u32,
    pub socket_open_failures: u32,
    pub token_fetch_failures: u32,
    pub refresh_failures: u32,
    pub unexpected_closes: u32,
    /// Classified subscription errors by kind since the last snapshot.
    pub errors: Vec<(ZenithErrorKind, u64)>,
}

/// Message family emitted by the publisher to the owning layer.
///
/// Operational telemetry and decoded protocol results share one enum so the
/// application consumes a single stream, in arrival order.
#[derive(Clone, Debug)]
pub enum SessionRecord {
    /// The connection engine changed state.
    StateChanged { state: EngineState },
    /// A reconnect was scheduled.
    Reconnected { reason: ReconnectReason },
    /// The session went online or offline.
    OnlineChanged {
        online: bool,
        close_code: Option<u16>,
        close_reason: Option<String>,
        clean: bool,
    },
    /// Periodic counters.
    Counters(CountersSnapshot),
    /// Free-text operational log line.
    LogLine(String),
    /// The server terminated the session with the reserved close code.
    SessionKickedOff,
    /// All currently available data for a request has been delivered.
    Synchronised {
        subscription: SubscriptionId,
        already_unsubscribed: bool,
    },
    /// Server warning, not necessarily fatal to the subscription.
    Warning {
        subscription: Option<SubscriptionId>,
        text: String,
    },
    /// Classified subscription error.
    Error {
        subscription: Option<SubscriptionId>,
        kind: ZenithErrorKind,
        text: String,
        allowed_retry: AllowedRetry,
    },
    /// Opaque decoded payload for a subscription; payload decode is owned by
    /// the layer above this engine.
    Payload {
        subscription: SubscriptionId,
        envelope: ZenithEnvelope,
    },
}
