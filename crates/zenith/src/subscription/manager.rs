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

//! Zenith-specific subscription management.
//!
//! Layers message correlation, inbound dispatch and error classification over
//! the [`SubscriptionRegistry`]. Two independent addressing schemes are used:
//! Publish requests correlate by the transaction id assigned at send time,
//! Sub/Unsub requests by the controller+topic composite.
//!
//! Inbound frames buffer as received and drain once per [`tick`], which also
//! flushes the send queue and scans response deadlines, all inside the
//! single-writer actor, so no locking is needed.
//!
//! [`tick`]: ZenithSubscriptionManager::tick

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use super::registry::{
    CorrelationKey, FailureDisposition, RequestDefinition, SubscriptionId, SubscriptionRegistry,
    UnsubscribeOutcome,
};
use crate::{
    common::{
        consts::AUTH_CONTROLLER,
        enums::{
            AllowedRetry, MessageAction, MessageLogLevel, Subscribability, SubscriptionStatus,
            ZenithErrorKind,
        },
    },
    events::SessionRecord,
    messages::{ErrorPayload, ZenithEnvelope, extract_error, parse_frame},
};

/// Whether a classified error arrived on a Publish or a Sub exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplyContext {
    Publish,
    Sub,
}

/// Classifies a wire error into a retry permission.
///
/// Publish-response errors default to `Never` unless explicitly marked
/// retryable; Sub errors without a marker park the subscription until
/// subscribability improves.
fn classify(kind: ZenithErrorKind, retryable: bool, context: ReplyContext) -> AllowedRetry {
    if kind == ZenithErrorKind::UserNotAuthorised {
        return AllowedRetry::Never;
    }
    if retryable {
        return AllowedRetry::Delay;
    }
    match context {
        ReplyContext::Publish => AllowedRetry::Never,
        ReplyContext::Sub => AllowedRetry::SubscribabilityIncrease,
    }
}

/// Protocol-specific subscription manager for one Zenith session.
#[derive(Debug)]
pub struct ZenithSubscriptionManager {
    registry: SubscriptionRegistry,
    correlations: IndexMap<CorrelationKey, SubscriptionId>,
    inbound: VecDeque<String>,
    auth_frames: VecDeque<ZenithEnvelope>,
    records: VecDeque<SessionRecord>,
    tx_counter: u64,
    response_timeout: Duration,
    max_send_batch: usize,
    log_level: MessageLogLevel,
    logged_replies: AHashSet<CorrelationKey>,
    error_counts: AHashMap<ZenithErrorKind, u64>,
    frames_sent: u64,
    frames_received: u64,
}

impl ZenithSubscriptionManager {
    /// Creates a manager in the offline state.
    #[must_use]
    pub fn new(
        response_timeout: Duration,
        max_send_batch: usize,
        log_level: MessageLogLevel,
    ) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            correlations: IndexMap::new(),
            inbound: VecDeque::new(),
            auth_frames: VecDeque::new(),
            records: VecDeque::new(),
            tx_counter: 0,
            response_timeout,
            max_send_batch,
            log_level,
            logged_replies: AHashSet::new(),
            error_counts: AHashMap::new(),
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Returns the underlying registry (read only).
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Returns the next transaction id.
    ///
    /// The id space is shared between subscription Publish requests and the
    /// authentication exchanges the publisher sends on the same socket.
    pub fn next_transaction_id(&mut self) -> u64 {
        self.tx_counter += 1;
        self.tx_counter
    }

    /// Creates a subscription and queues it for the next tick.
    pub fn subscribe(&mut self, id: SubscriptionId, definition: RequestDefinition) {
        self.registry.subscribe(id, definition);
    }

    /// Creates a dormant subscription for later activation.
    pub fn subscribe_deferred(&mut self, id: SubscriptionId, definition: RequestDefinition) {
        self.registry.subscribe_deferred(id, definition);
    }

    /// Activates a dormant subscription under the given request number.
    pub fn activate(&mut self, id: SubscriptionId, request_nr: u64) {
        self.registry.activate(id, request_nr);
    }

    /// Requests removal of a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        match self.registry.unsubscribe(id) {
            UnsubscribeOutcome::Removed(_) => {
                self.correlations.retain(|_, sub_id| *sub_id != id);
                self.records.push_back(SessionRecord::Synchronised {
                    subscription: id,
                    already_unsubscribed: true,
                });
            }
            UnsubscribeOutcome::Deactivating => {
                // The in-flight wait was cancelled; drop its correlation so a
                // late reply is ignored.
                self.correlations.retain(|_, sub_id| *sub_id != id);
            }
            UnsubscribeOutcome::NotFound => {
                tracing::debug!("Unsubscribe for unknown subscription {id}");
            }
        }
    }

    /// Records the session's subscribability level.
    pub fn note_subscribability(&mut self, level: Subscribability) {
        let released = self.registry.note_subscribability(level);
        if !released.is_empty() {
            tracing::debug!(
                "Subscribability {level} released {} parked subscriptions",
                released.len(),
            );
        }
    }

    /// Buffers one raw inbound frame for the next tick.
    pub fn buffer_frame(&mut self, text: String) {
        self.frames_received += 1;
        self.inbound.push_back(text);
    }

    /// Resumes sends after the session came online.
    pub fn come_online(&mut self) {
        self.registry.come_online();
    }

    /// Suspends the manager: no sends occur, and in-flight waits are failed
    /// with reason `Offlined`.
    pub fn go_offline(&mut self) {
        let outcome = self.registry.go_offline();
        self.correlations.clear();
        self.logged_replies.clear();
        self.inbound.clear();

        for id in outcome.offlined {
            self.emit_error(
                Some(id),
                ZenithErrorKind::Offlined,
                "request in flight when session went offline".to_string(),
                AllowedRetry::Delay,
            );
        }
        for sub in outcome.dropped {
            self.emit_error(
                Some(sub.id),
                ZenithErrorKind::Offlined,
                format!(
                    "non-retransmittable request {}/{} lost offline",
                    sub.definition.controller, sub.definition.topic,
                ),
                AllowedRetry::Never,
            );
        }
    }

    /// Drains all state, leaving no resources allocated.
    pub fn finalise(&mut self) {
        self.registry.finalise();
        self.correlations.clear();
        self.inbound.clear();
        self.auth_frames.clear();
        self.logged_replies.clear();
    }

    /// Pops the next record for the owning layer.
    pub fn pop_record(&mut self) -> Option<SessionRecord> {
        self.records.pop_front()
    }

    /// Pops the next envelope addressed to the authentication sub-protocol.
    pub fn pop_auth_frame(&mut self) -> Option<ZenithEnvelope> {
        self.auth_frames.pop_front()
    }

    /// Returns cumulative frame counters (sent, received).
    #[must_use]
    pub fn frame_counts(&self) -> (u64, u64) {
        (self.frames_sent, self.frames_received)
    }

    /// Drains the per-kind error counts accumulated since the last call.
    pub fn take_error_counts(&mut self) -> Vec<(ZenithErrorKind, u64)> {
        let mut counts: Vec<(ZenithErrorKind, u64)> = self.error_counts.drain().collect();
        counts.sort_by_key(|(kind, _)| *kind as u8);
        counts
    }

    /// One scheduling pass: dispatch buffered frames, scan deadlines, requeue
    /// elapsed retries, then flush the send queue.
    ///
    /// Returns the serialized frames to transmit, in send order.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        while let Some(text) = self.inbound.pop_front() {
            match parse_frame(&text) {
                Ok(envelope) => self.dispatch(envelope, now),
                Err(e) => tracing::warn!("Failed to parse inbound frame: {e}"),
            }
        }

        for (id, key) in self.registry.expired(now) {
            self.correlations.swap_remove(&key);
            self.fail_subscription(
                id,
                ZenithErrorKind::RequestTimeout,
                format!(
                    "no response within {}ms",
                    self.response_timeout.as_millis()
                ),
                AllowedRetry::Delay,
                now,
            );
        }

        self.registry.due_retries(now);
        self.flush_send_queue(now)
    }

    // --------------------------------------------------------------------------------------------
    // Outbound
    // --------------------------------------------------------------------------------------------

    fn flush_send_queue(&mut self, now: Instant) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < self.max_send_batch {
            let Some(id) = self.registry.pop_sendable() else {
                break;
            };
            if let Some(frame) = self.build_frame(id, now) {
                out.push(frame);
            }
        }
        self.frames_sent += out.len() as u64;
        out
    }

    fn build_frame(&mut self, id: SubscriptionId, now: Instant) -> Option<String> {
        let (controller, topic, unsubscribe_required, action, params) = {
            let sub = self.registry.get(id)?;
            (
                sub.definition.controller,
                sub.definition.topic,
                sub.unsubscribe_required,
                sub.definition.action,
                sub.definition.params.clone(),
            )
        };

        if unsubscribe_required {
            let envelope = ZenithEnvelope::new(
                controller,
                topic,
                MessageAction::Unsub,
                None,
                serde_json::Value::Null,
            );
            self.correlations
                .swap_remove(&CorrelationKey::Topic { controller, topic });
            self.registry.mark_unsubscribe_sent(id);
            return self.serialize_outbound(&envelope);
        }

        let (key, envelope) = match action {
            MessageAction::Publish => {
                let tx_id = self.next_transaction_id();
                (
                    CorrelationKey::Transaction(tx_id),
                    ZenithEnvelope::new(
                        controller,
                        topic,
                        MessageAction::Publish,
                        Some(tx_id),
                        params,
                    ),
                )
            }
            MessageAction::Sub => (
                CorrelationKey::Topic { controller, topic },
                ZenithEnvelope::new(controller, topic, MessageAction::Sub, None, params),
            ),
            other => {
                self.fail_subscription(
                    id,
                    ZenithErrorKind::Internal,
                    format!("definition has non-sendable action {other}"),
                    AllowedRetry::Never,
                    now,
                );
                return None;
            }
        };

        // Correlation keys must be unique among outstanding requests; a
        // duplicate topic means another live subscription already owns it.
        if self.correlations.contains_key(&key) {
            self.fail_subscription(
                id,
                ZenithErrorKind::Internal,
                format!("correlation key for {controller}/{topic} already outstanding"),
                AllowedRetry::Delay,
                now,
            );
            return None;
        }

        self.correlations.insert(key, id);
        self.registry
            .mark_subscribe_sent(id, key, now + self.response_timeout);
        self.serialize_outbound(&envelope)
    }

    fn serialize_outbound(&mut self, envelope: &ZenithEnvelope) -> Option<String> {
        match serde_json::to_string(envelope) {
            Ok(frame) => {
                if self.log_level != MessageLogLevel::Off {
                    tracing::debug!("OUT {frame}");
                }
                Some(frame)
            }
            Err(e) => {
                tracing::error!("Failed to serialize outbound frame: {e}");
                None
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Inbound dispatch
    // --------------------------------------------------------------------------------------------

    fn dispatch(&mut self, envelope: ZenithEnvelope, now: Instant) {
        if envelope.controller.as_str() == AUTH_CONTROLLER {
            self.auth_frames.push_back(envelope);
            return;
        }

        self.log_inbound(&envelope);

        match envelope.action() {
            MessageAction::Publish => self.on_publish_reply(envelope, now),
            MessageAction::Sub => self.on_sub_reply(envelope, now),
            MessageAction::Unsub => self.on_unsub_reply(envelope, now),
            MessageAction::Error => self.on_server_warning(&envelope),
            MessageAction::Cancel => {
                tracing::warn!("Unexpected inbound Cancel for {}", envelope.topic);
            }
        }
    }

    fn on_publish_reply(&mut self, envelope: ZenithEnvelope, now: Instant) {
        let Some(tx_id) = envelope.transaction_id else {
            tracing::warn!("Publish reply without transaction id for {}", envelope.topic);
            return;
        };
        let key = CorrelationKey::Transaction(tx_id);
        let Some(id) = self.correlations.get(&key).copied() else {
            // Already unsubscribed; the burst is stale.
            tracing::debug!("Publish reply {tx_id} has no outstanding request");
            return;
        };

        if let Some(error) = extract_error(&envelope.data) {
            let kind = error.kind().unwrap_or(ZenithErrorKind::PublishRequestError);
            let allowed = classify(kind, error.retryable, ReplyContext::Publish);
            self.correlations.swap_remove(&key);
            self.fail_subscription(id, kind, error.text(), allowed, now);
            return;
        }

        // One-shot: deliver, mark the burst complete, release the
        // subscription.
        self.correlations.swap_remove(&key);
        self.registry.remove(id);
        self.records.push_back(SessionRecord::Payload {
            subscription: id,
            envelope,
        });
        self.records.push_back(SessionRecord::Synchronised {
            subscription: id,
            already_unsubscribed: false,
        });
    }

    fn on_sub_reply(&mut self, envelope: ZenithEnvelope, now: Instant) {
        let key = CorrelationKey::Topic {
            controller: envelope.controller,
            topic: envelope.topic,
        };
        let Some(id) = self.correlations.get(&key).copied() else {
            tracing::debug!(
                "Sub frame for {}/{} has no live subscription",
                envelope.controller,
                envelope.topic,
            );
            return;
        };

        if let Some(error) = extract_error(&envelope.data) {
            let kind = error.kind().unwrap_or(ZenithErrorKind::SubRequestError);
            let allowed = classify(kind, error.retryable, ReplyContext::Sub);
            self.correlations.swap_remove(&key);
            self.fail_subscription(id, kind, error.text(), allowed, now);
            return;
        }

        if envelope.is_confirm() {
            // Initial acknowledgement; the correlation stays live for the
            // data stream that follows.
            if self
                .registry
                .get(id)
                .is_some_and(|s| s.status == SubscriptionStatus::ResponseWaiting)
            {
                self.registry.mark_subscribed(id);
                self.records.push_back(SessionRecord::Synchronised {
                    subscription: id,
                    already_unsubscribed: false,
                });
            }
            return;
        }

        // Data neither confirms nor errors; forward with state unchanged.
        self.records.push_back(SessionRecord::Payload {
            subscription: id,
            envelope,
        });
    }

    fn on_unsub_reply(&mut self, envelope: ZenithEnvelope, now: Instant) {
        let key = CorrelationKey::Topic {
            controller: envelope.controller,
            topic: envelope.topic,
        };
        let Some(id) = self.correlations.get(&key).copied() else {
            tracing::debug!(
                "Unsub reply for {}/{} has no live subscription",
                envelope.controller,
                envelope.topic,
            );
            return;
        };
        if !envelope.is_confirm() {
            return;
        }

        // The protocol never legitimately confirms a plain unsubscribe.
        let error = extract_error(&envelope.data);
        let kind = error
            .as_ref()
            .and_then(ErrorPayload::kind)
            .unwrap_or(ZenithErrorKind::UserNotAuthorised);
        let retryable = error.as_ref().is_some_and(|e| e.retryable);
        let allowed = if retryable {
            AllowedRetry::Delay
        } else {
            AllowedRetry::Never
        };
        let text = error.map_or_else(
            || "unsubscribe confirmed by server".to_string(),
            |e| e.text(),
        );
        self.correlations.swap_remove(&key);
        self.fail_subscription(id, kind, text, allowed, now);
    }

    fn on_server_warning(&mut self, envelope: &ZenithEnvelope) {
        // Warnings carry no action-specific correlation; try the Publish key
        // first, then fall back to the Sub key.
        let subscription = envelope
            .transaction_id
            .and_then(|tx_id| {
                self.correlations
                    .get(&CorrelationKey::Transaction(tx_id))
                    .copied()
            })
            .or_else(|| {
                self.correlations
                    .get(&CorrelationKey::Topic {
                        controller: envelope.controller,
                        topic: envelope.topic,
                    })
                    .copied()
            });

        let text = extract_error(&envelope.data).map_or_else(
            || envelope.data.to_string(),
            |e| e.text(),
        );
        tracing::warn!("Server warning for {}/{}: {text}", envelope.controller, envelope.topic);
        self.records.push_back(SessionRecord::Warning { subscription, text });
    }

    // --------------------------------------------------------------------------------------------
    // Failure handling
    // --------------------------------------------------------------------------------------------

    fn emit_error(
        &mut self,
        subscription: Option<SubscriptionId>,
        kind: ZenithErrorKind,
        text: String,
        allowed_retry: AllowedRetry,
    ) {
        *self.error_counts.entry(kind).or_insert(0) += 1;
        self.records.push_back(SessionRecord::Error {
            subscription,
            kind,
            text,
            allowed_retry,
        });
    }

    fn fail_subscription(
        &mut self,
        id: SubscriptionId,
        kind: ZenithErrorKind,
        text: String,
        allowed: AllowedRetry,
        now: Instant,
    ) {
        self.emit_error(Some(id), kind, text, allowed);
        self.correlations.retain(|_, sub_id| *sub_id != id);
        match self.registry.apply_failure(id, allowed, now) {
            Some(FailureDisposition::Removed(sub)) => {
                tracing::debug!("Subscription {id} removed after {kind}: {}", sub.definition.topic);
            }
            Some(FailureDisposition::Rescheduled(delay)) => {
                tracing::debug!("Subscription {id} rescheduled in {}ms", delay.as_millis());
            }
            Some(FailureDisposition::Parked) => {
                tracing::debug!("Subscription {id} parked awaiting subscribability");
            }
            None => {}
        }
    }

    fn log_inbound(&mut self, envelope: &ZenithEnvelope) {
        match self.log_level {
            MessageLogLevel::Off => {}
            MessageLogLevel::Full => {
                tracing::trace!(
                    "IN {}/{} {}",
                    envelope.controller,
                    envelope.topic,
                    envelope.data,
                );
            }
            MessageLogLevel::Partial => {
                let key = match envelope.action() {
                    MessageAction::Publish => {
                        envelope.transaction_id.map(CorrelationKey::Transaction)
                    }
                    _ => Some(CorrelationKey::Topic {
                        controller: envelope.controller,
                        topic: envelope.topic,
                    }),
                };
                if let Some(key) = key
                    && self.logged_replies.insert(key)
                {
                    tracing::debug!(
                        "IN {}/{} (first reply)",
                        envelope.controller,
                        envelope.topic,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use ustr::Ustr;

    use super::*;
    use crate::common::enums::RequestPriority;

    const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

    fn online_manager() -> ZenithSubscriptionManager {
        let mut manager =
            ZenithSubscriptionManager::new(RESPONSE_TIMEOUT, 20, MessageLogLevel::Off);
        manager.come_online();
        manager
    }

    fn trades_defn(priority: RequestPriority) -> RequestDefinition {
        RequestDefinition {
            priority,
            ..RequestDefinition::stream(Ustr::from("Trades"), Ustr::from("AAPL.XASX"))
        }
    }

    fn drain_records(manager: &mut ZenithSubscriptionManager) -> Vec<SessionRecord> {
        let mut records = Vec::new();
        while let Some(record) = manager.pop_record() {
            records.push(record);
        }
        records
    }

    #[rstest]
    fn test_high_priority_subscribe_confirm_flow() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::High));
        assert_eq!(manager.registry().queued(RequestPriority::High), 1);

        let frames = manager.tick(now);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"action\":\"Sub\""));
        assert_eq!(
            manager.registry().get(id).unwrap().status,
            SubscriptionStatus::ResponseWaiting,
        );
        assert!(manager.registry().get(id).unwrap().pending.is_some());

        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub", "confirm": true}"#
                .to_string(),
        );
        manager.tick(now + Duration::from_millis(100));

        assert_eq!(
            manager.registry().get(id).unwrap().status,
            SubscriptionStatus::Subscribed,
        );
        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Synchronised { subscription, already_unsubscribed: false }
                if *subscription == id
        )));
    }

    #[rstest]
    fn test_publish_correlates_only_matching_transaction_id() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(
            id,
            RequestDefinition::query(
                Ustr::from("Market"),
                Ustr::from("QueryMarkets"),
                serde_json::json!({"exchange": "XASX"}),
            ),
        );
        let frames = manager.tick(now);
        assert!(frames[0].contains("\"transactionId\":1"));

        // A reply with a different id never matches.
        manager.buffer_frame(
            r#"{"controller": "Market", "topic": "QueryMarkets", "transactionId": 99, "data": {}}"#
                .to_string(),
        );
        manager.tick(now);
        assert!(manager.registry().get(id).is_some());
        assert!(drain_records(&mut manager).is_empty());

        // The matching id completes the one-shot.
        manager.buffer_frame(
            r#"{"controller": "Market", "topic": "QueryMarkets", "transactionId": 1, "data": {"markets": []}}"#
                .to_string(),
        );
        manager.tick(now);
        assert!(manager.registry().get(id).is_none());
        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(r, SessionRecord::Payload { .. })));
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Synchronised { already_unsubscribed: false, .. }
        )));
    }

    #[rstest]
    fn test_unsub_confirm_is_always_an_error() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);
        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub", "confirm": true}"#
                .to_string(),
        );
        manager.tick(now);
        drain_records(&mut manager);

        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Unsub", "confirm": true}"#
                .to_string(),
        );
        manager.tick(now);

        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Error {
                kind: ZenithErrorKind::UserNotAuthorised,
                allowed_retry: AllowedRetry::Never,
                ..
            }
        )));
        assert!(manager.registry().get(id).is_none());
    }

    #[rstest]
    fn test_request_timeout_emits_once_and_reschedules() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);

        let late = now + RESPONSE_TIMEOUT + Duration::from_secs(1);
        manager.tick(late);

        let records = drain_records(&mut manager);
        let timeouts: Vec<_> = records
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    SessionRecord::Error {
                        kind: ZenithErrorKind::RequestTimeout,
                        allowed_retry: AllowedRetry::Delay,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(
            manager.registry().get(id).unwrap().status,
            SubscriptionStatus::Inactive,
        );

        // No duplicate on the next tick.
        manager.tick(late + Duration::from_secs(1));
        assert!(drain_records(&mut manager).is_empty());
    }

    #[rstest]
    fn test_sub_error_with_retryable_marker_reschedules() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);

        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub",
                "data": {"error": {"code": "SubRequestError", "retryable": true}}}"#
                .to_string(),
        );
        manager.tick(now);

        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Error { allowed_retry: AllowedRetry::Delay, .. }
        )));
        assert_eq!(
            manager.registry().get(id).unwrap().status,
            SubscriptionStatus::Inactive,
        );
    }

    #[rstest]
    fn test_sub_error_without_marker_parks() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);

        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub",
                "data": {"error": {"code": "DataError"}}}"#
                .to_string(),
        );
        manager.tick(now);
        assert!(manager.registry().get(id).unwrap().awaiting_subscribability);

        manager.note_subscribability(Subscribability::Some);
        let frames = manager.tick(now + Duration::from_secs(1));
        assert_eq!(frames.len(), 1);
    }

    #[rstest]
    fn test_auth_frames_routed_separately() {
        let mut manager = online_manager();
        let now = Instant::now();
        manager.buffer_frame(
            r#"{"controller": "Auth", "topic": "AuthToken", "transactionId": 7,
                "data": {"result": "Success", "accessToken": "z", "expiresIn": 600}}"#
                .to_string(),
        );
        manager.tick(now);

        assert!(drain_records(&mut manager).is_empty());
        let frame = manager.pop_auth_frame().unwrap();
        assert_eq!(frame.topic.as_str(), "AuthToken");
    }

    #[rstest]
    fn test_server_warning_resolves_publish_then_sub_key() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);

        manager.buffer_frame(
            r#"{"controller": "Trades", "topic": "AAPL.XASX", "action": "Error",
                "data": {"error": {"message": "degraded feed"}}}"#
                .to_string(),
        );
        manager.tick(now);

        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Warning { subscription: Some(sub), .. } if *sub == id
        )));
        // Warnings do not tear down the subscription.
        assert!(manager.registry().get(id).is_some());
    }

    #[rstest]
    fn test_go_offline_fails_in_flight_with_offlined() {
        let mut manager = online_manager();
        let now = Instant::now();
        let id = SubscriptionId(1);
        manager.subscribe(id, trades_defn(RequestPriority::Normal));
        manager.tick(now);

        manager.go_offline();
        let records = drain_records(&mut manager);
        assert!(records.iter().any(|r| matches!(
            r,
            SessionRecord::Error { kind: ZenithErrorKind::Offlined, .. }
        )));

        // Nothing sends while offline.
        assert!(manager.tick(now + Duration::from_secs(60)).is_empty());

        // The subscription resubscribes on the next online transition.
        manager.come_online();
        let frames = manager.tick(now + Duration::from_secs(61));
        assert_eq!(frames.len(), 1);
    }

    #[rstest]
    fn test_batch_drain_bound_respected() {
        let mut manager = ZenithSubscriptionManager::new(
            RESPONSE_TIMEOUT,
            2,
            MessageLogLevel::Off,
        );
        manager.come_online();
        let now = Instant::now();
        for n in 0..5 {
            manager.subscribe(
                SubscriptionId(n),
                RequestDefinition::stream(Ustr::from("Trades"), Ustr::from(format!("T{n}").as_str())),
            );
        }
        assert_eq!(manager.tick(now).len(), 2);
        assert_eq!(manager.tick(now).len(), 2);
        assert_eq!(manager.tick(now).len(), 1);
    }
}
