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

//! Client engine for the Zenith streaming market-data and trading protocol.
//!
//! The engine holds one authenticated session against a remote publisher over
//! a persistent WebSocket and multiplexes many independent, priority-ordered,
//! retryable subscriptions over it, correlating asynchronous replies back to
//! the requests that caused them.
//!
//! # Architecture
//!
//! - [`connection::ConnectionStateEngine`]: the fenced lifecycle state
//!   machine (authenticate, open, token refresh, close, reconnect) with
//!   per-action timeouts and per-failure-category backoff.
//! - [`subscription::SubscriptionRegistry`]: subscription ownership, the
//!   High/Normal priority send queue, response deadlines and retry
//!   scheduling.
//! - [`subscription::ZenithSubscriptionManager`]: protocol-specific message
//!   correlation (transaction-id and controller+topic addressing), inbound
//!   dispatch and error classification.
//! - [`handler::SessionHandler`]: the single-writer actor binding the above
//!   to a [`transport::SocketTransport`] and an
//!   [`auth::AccessTokenProvider`].
//! - [`client::ZenithClient`]: the public facade.
//!
//! All mutable session state is owned by the actor task; every asynchronous
//! completion carries the fencing token captured when it was scheduled, and
//! stale completions are discarded, giving linearizable semantics without
//! locks.

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod client;
pub mod common;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod messages;
pub mod retry;
pub mod subscription;
pub mod transport;

pub use client::ZenithClient;
pub use config::ZenithClientConfig;
pub use error::{ZenithWsError, ZenithWsResult};
pub use events::SessionRecord;
