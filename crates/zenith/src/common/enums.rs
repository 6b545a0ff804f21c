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

//! Enumerations for Zenith wire messages and subscription lifecycle.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Action discriminator carried on every Zenith envelope.
///
/// The field may be omitted on the wire: a frame with a transaction id is a
/// `Publish`, anything else is a `Sub`.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum MessageAction {
    /// One-shot request/reply (queries, order placement/amend/cancel/move).
    Publish,
    /// Streaming subscription start.
    Sub,
    /// Streaming subscription stop.
    Unsub,
    /// Server-originated warning not tied to a specific action.
    Error,
    /// Cancellation of an in-flight request (outbound only).
    Cancel,
}

/// Send priority of a queued request.
///
/// The high queue always fully drains before the normal queue on each tick.
#[derive(
    Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize,
)]
pub enum RequestPriority {
    High,
    #[default]
    Normal,
}

/// Authentication scheme selected at connect time.
///
/// The two schemes are mutually exclusive; exactly one is active for the
/// lifetime of a connection.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
pub enum AuthScheme {
    /// Bearer access token fetched from an external provider.
    AuthToken,
    /// Username/password owner credentials.
    AuthOwner,
}

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, AsRefStr)]
pub enum SubscriptionStatus {
    /// Created, not currently queued or in flight.
    #[default]
    Inactive,
    /// Waiting in the send queue.
    Queued,
    /// Transmitted, awaiting the correlated reply.
    ResponseWaiting,
    /// Streaming subscription confirmed by the server.
    Subscribed,
}

/// Kind of an outstanding request.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
}

/// Classified subscription error kinds.
///
/// `Internal`, `Offlined` and `RequestTimeout` are synthesized locally and
/// never received over the wire; the remainder map from wire error codes.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum ZenithErrorKind {
    Internal,
    Offlined,
    RequestTimeout,
    UserNotAuthorised,
    PublishRequestError,
    SubRequestError,
    DataError,
}

/// Retry permission attached to a classified subscription error.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
pub enum AllowedRetry {
    /// Permanent: the subscription is removed.
    Never,
    /// Retry after the backoff computed from the subscription's delay policy.
    Delay,
    /// Retry only once overall subscribability improves.
    SubscribabilityIncrease,
}

/// Degree to which the session can currently service subscriptions.
///
/// A rising level authorizes retries previously blocked with
/// [`AllowedRetry::SubscribabilityIncrease`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr)]
pub enum Subscribability {
    #[default]
    None,
    Some,
    All,
}

/// Tiered protocol-message logging.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
pub enum MessageLogLevel {
    /// No per-message logging.
    #[default]
    Off,
    /// All outbound frames plus the first inbound reply per request.
    Partial,
    /// Every frame in both directions.
    Full,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_message_action_round_trip() {
        let json = serde_json::to_string(&MessageAction::Unsub).unwrap();
        assert_eq!(json, "\"Unsub\"");
        let action: MessageAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, MessageAction::Unsub);
    }

    #[rstest]
    #[case("UserNotAuthorised", ZenithErrorKind::UserNotAuthorised)]
    #[case("SubRequestError", ZenithErrorKind::SubRequestError)]
    fn test_error_kind_from_str(#[case] input: &str, #[case] expected: ZenithErrorKind) {
        assert_eq!(input.parse::<ZenithErrorKind>().unwrap(), expected);
    }

    #[rstest]
    fn test_subscribability_ordering() {
        assert!(Subscribability::None < Subscribability::Some);
        assert!(Subscribability::Some < Subscribability::All);
    }
}
