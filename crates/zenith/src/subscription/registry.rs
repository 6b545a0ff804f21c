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

//! Subscription store with priority send queues, response deadlines and
//! retry scheduling.
//!
//! The registry owns every [`Subscription`] exclusively. Protocol-specific
//! concerns (building wire requests, correlating replies) live in the
//! [`ZenithSubscriptionManager`](super::manager::ZenithSubscriptionManager)
//! layered on top.

use std::{collections::VecDeque, time::Instant};

use ahash::AHashMap;
use ustr::Ustr;

use crate::{
    common::enums::{
        AllowedRetry, MessageAction, RequestKind, RequestPriority, Subscribability,
        SubscriptionStatus,
    },
    retry::{RetryDelayPolicy, retry_delay},
};

/// Identity of one logical, addressable data feed or query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key correlating an inbound reply to the outstanding request that caused it.
///
/// Publish requests correlate by the transaction id assigned at send time;
/// Sub/Unsub requests correlate by the controller+topic composite because the
/// protocol carries no transaction id on streamed topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Transaction(u64),
    Topic { controller: Ustr, topic: Ustr },
}

/// Opaque request definition supplied by the caller.
#[derive(Clone, Debug)]
pub struct RequestDefinition {
    /// Controller name addressed by the request.
    pub controller: Ustr,
    /// Topic within the controller.
    pub topic: Ustr,
    /// `Publish` for one-shot queries and order actions, `Sub` for streams.
    pub action: MessageAction,
    /// Send priority.
    pub priority: RequestPriority,
    /// Whether the request may ever be retransmitted.
    pub resend_allowed: bool,
    /// Backoff table governing retries.
    pub retry_policy: RetryDelayPolicy,
    /// Request parameters, opaque to this engine.
    pub params: serde_json::Value,
}

impl RequestDefinition {
    /// Creates a streaming subscription definition with default scheduling.
    #[must_use]
    pub fn stream(controller: Ustr, topic: Ustr) -> Self {
        Self {
            controller,
            topic,
            action: MessageAction::Sub,
            priority: RequestPriority::Normal,
            resend_allowed: true,
            retry_policy: RetryDelayPolicy::Default,
            params: serde_json::Value::Null,
        }
    }

    /// Creates a one-shot query definition with default scheduling.
    #[must_use]
    pub fn query(controller: Ustr, topic: Ustr, params: serde_json::Value) -> Self {
        Self {
            controller,
            topic,
            action: MessageAction::Publish,
            priority: RequestPriority::Normal,
            resend_allowed: true,
            retry_policy: RetryDelayPolicy::Default,
            params,
        }
    }
}

/// Transient wrapper correlating a subscription to an outstanding send.
#[derive(Clone, Copy, Debug)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub key: CorrelationKey,
    pub deadline: Instant,
}

/// One owned subscription with its scheduling bookkeeping.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub definition: RequestDefinition,
    pub status: SubscriptionStatus,
    pub been_sent: bool,
    pub unsubscribe_required: bool,
    pub activated: bool,
    pub request_nr: Option<u64>,
    /// Consecutive failed attempts, feeding the backoff table.
    pub attempts: u32,
    /// Earliest instant a rescheduled retry may be queued again.
    pub resend_due: Option<Instant>,
    /// Parked until overall subscribability improves.
    pub awaiting_subscribability: bool,
    pub pending: Option<PendingRequest>,
}

impl Subscription {
    fn new(id: SubscriptionId, definition: RequestDefinition, activated: bool) -> Self {
        Self {
            id,
            definition,
            status: SubscriptionStatus::Inactive,
            been_sent: false,
            unsubscribe_required: false,
            activated,
            request_nr: None,
            attempts: 0,
            resend_due: None,
            awaiting_subscribability: false,
            pending: None,
        }
    }

    /// Returns the controller+topic correlation key for this subscription.
    #[must_use]
    pub fn topic_key(&self) -> CorrelationKey {
        CorrelationKey::Topic {
            controller: self.definition.controller,
            topic: self.definition.topic,
        }
    }
}

/// Outcome of a classified failure applied to a subscription.
#[derive(Debug)]
pub enum FailureDisposition {
    /// Permanently removed.
    Removed(Box<Subscription>),
    /// Returned to `Inactive`, queued again after the given backoff.
    Rescheduled(std::time::Duration),
    /// Returned to `Inactive`, parked until subscribability improves.
    Parked,
}

/// Outcome of an unsubscribe request.
#[derive(Debug)]
pub enum UnsubscribeOutcome {
    /// Never transmitted; removed without any wire traffic.
    Removed(Box<Subscription>),
    /// Transmitted at least once; an Unsub request has been queued.
    Deactivating,
    /// Unknown id.
    NotFound,
}

/// Subscriptions released by a bulk offline transition.
#[derive(Debug, Default)]
pub struct OfflineOutcome {
    /// Had a request in flight; the wait is failed with reason `Offlined`.
    pub offlined: Vec<SubscriptionId>,
    /// In flight but not retransmittable; removed outright.
    pub dropped: Vec<Subscription>,
}

/// Owns all subscriptions, the priority send queue and deadline tracking.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    subs: AHashMap<SubscriptionId, Subscription>,
    high_queue: VecDeque<SubscriptionId>,
    normal_queue: VecDeque<SubscriptionId>,
    online: bool,
    subscribability: Subscribability,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry in the offline state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subs: AHashMap::new(),
            high_queue: VecDeque::new(),
            normal_queue: VecDeque::new(),
            online: false,
            subscribability: Subscribability::None,
        }
    }

    /// Returns the number of owned subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Returns whether the registry owns no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Returns whether sends are currently permitted.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Returns a subscription by id.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subs.get(&id)
    }

    /// Returns a mutable subscription by id.
    pub fn get_mut(&mut self, id: SubscriptionId) -> Option<&mut Subscription> {
        self.subs.get_mut(&id)
    }

    /// Returns the number of entries waiting in the given queue.
    #[must_use]
    pub fn queued(&self, priority: RequestPriority) -> usize {
        match priority {
            RequestPriority::High => self.high_queue.len(),
            RequestPriority::Normal => self.normal_queue.len(),
        }
    }

    /// Creates a subscription and queues it for transmission on the next tick.
    pub fn subscribe(&mut self, id: SubscriptionId, definition: RequestDefinition) {
        let sub = Subscription::new(id, definition, true);
        self.subs.insert(id, sub);
        self.enqueue(id, RequestKind::Subscribe);
    }

    /// Creates a dormant subscription that will not send until activated.
    pub fn subscribe_deferred(&mut self, id: SubscriptionId, definition: RequestDefinition) {
        let sub = Subscription::new(id, definition, false);
        self.subs.insert(id, sub);
    }

    /// Two-phase start: lets a dormant subscription begin participating in
    /// sends, tagged with the scheduler's request number.
    pub fn activate(&mut self, id: SubscriptionId, request_nr: u64) {
        let Some(sub) = self.subs.get_mut(&id) else {
            return;
        };
        if sub.activated {
            return;
        }
        sub.activated = true;
        sub.request_nr = Some(request_nr);
        self.enqueue(id, RequestKind::Subscribe);
    }

    /// Requests removal of a subscription.
    ///
    /// A subscription that was never transmitted is simply removed; otherwise
    /// it is marked for unsubscription and an Unsub request is queued.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> UnsubscribeOutcome {
        let Some(sub) = self.subs.get_mut(&id) else {
            return UnsubscribeOutcome::NotFound;
        };

        if !sub.been_sent {
            self.remove_from_queues(id);
            return match self.subs.remove(&id) {
                Some(sub) => UnsubscribeOutcome::Removed(Box::new(sub)),
                None => UnsubscribeOutcome::NotFound,
            };
        }

        // Any in-flight wait is cancelled; the unsubscribe supersedes it.
        sub.pending = None;
        sub.unsubscribe_required = true;
        sub.resend_due = None;
        self.enqueue(id, RequestKind::Unsubscribe);
        UnsubscribeOutcome::Deactivating
    }

    /// Pops the next sendable subscription id, high queue first.
    ///
    /// Returns `None` while offline or when both queues are empty.
    pub fn pop_sendable(&mut self) -> Option<SubscriptionId> {
        if !self.online {
            return None;
        }
        loop {
            let id = self
                .high_queue
                .pop_front()
                .or_else(|| self.normal_queue.pop_front())?;
            // Entries can go stale when a subscription is removed while queued.
            if let Some(sub) = self.subs.get(&id)
                && sub.status == SubscriptionStatus::Queued
            {
                return Some(id);
            }
        }
    }

    /// Records the transmission of a Subscribe request and arms its deadline.
    pub fn mark_subscribe_sent(
        &mut self,
        id: SubscriptionId,
        key: CorrelationKey,
        deadline: Instant,
    ) {
        if let Some(sub) = self.subs.get_mut(&id) {
            sub.status = SubscriptionStatus::ResponseWaiting;
            sub.been_sent = true;
            sub.pending = Some(PendingRequest {
                kind: RequestKind::Subscribe,
                key,
                deadline,
            });
        }
    }

    /// Records the transmission of an Unsub request, removing the
    /// subscription.
    ///
    /// The protocol never legitimately confirms a plain unsubscribe, so no
    /// response deadline is armed.
    pub fn mark_unsubscribe_sent(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.subs.remove(&id)
    }

    /// Marks a streaming subscription as confirmed by the server.
    pub fn mark_subscribed(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.subs.get_mut(&id) {
            sub.status = SubscriptionStatus::Subscribed;
            sub.pending = None;
            sub.attempts = 0;
        }
    }

    /// Removes a subscription outright (one-shot completion).
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.remove_from_queues(id);
        self.subs.remove(&id)
    }

    /// Collects subscriptions whose response deadline has passed.
    ///
    /// Each expired wait is cleared; the caller synthesizes the timeout error
    /// and applies the retry disposition.
    pub fn expired(&mut self, now: Instant) -> Vec<(SubscriptionId, CorrelationKey)> {
        let mut out = Vec::new();
        for sub in self.subs.values_mut() {
            if let Some(pending) = &sub.pending
                && pending.deadline <= now
            {
                out.push((sub.id, pending.key));
                sub.pending = None;
            }
        }
        out
    }

    /// Re-queues subscriptions whose retry backoff has elapsed.
    pub fn due_retries(&mut self, now: Instant) -> Vec<SubscriptionId> {
        let due: Vec<SubscriptionId> = self
            .subs
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Inactive
                    && s.activated
                    && s.resend_due.is_some_and(|at| at <= now)
            })
            .map(|s| s.id)
            .collect();
        for id in &due {
            if let Some(sub) = self.subs.get_mut(id) {
                sub.resend_due = None;
            }
            self.enqueue(*id, RequestKind::Subscribe);
        }
        due
    }

    /// Applies a classified failure to a subscription.
    pub fn apply_failure(
        &mut self,
        id: SubscriptionId,
        allowed: AllowedRetry,
        now: Instant,
    ) -> Option<FailureDisposition> {
        let sub = self.subs.get_mut(&id)?;
        sub.pending = None;

        let retryable = allowed != AllowedRetry::Never
            && (sub.definition.resend_allowed || !sub.been_sent)
            && sub.definition.retry_policy != RetryDelayPolicy::Never;

        if !retryable {
            self.remove_from_queues(id);
            return self
                .subs
                .remove(&id)
                .map(|s| FailureDisposition::Removed(Box::new(s)));
        }

        let sub = self.subs.get_mut(&id)?;
        sub.status = SubscriptionStatus::Inactive;
        match allowed {
            AllowedRetry::Delay => {
                sub.attempts += 1;
                let delay = retry_delay(sub.definition.retry_policy, sub.attempts);
                sub.resend_due = Some(now + delay);
                Some(FailureDisposition::Rescheduled(delay))
            }
            AllowedRetry::SubscribabilityIncrease => {
                sub.awaiting_subscribability = true;
                Some(FailureDisposition::Parked)
            }
            AllowedRetry::Never => unreachable!("handled above"),
        }
    }

    /// Records the session's subscribability level, releasing parked
    /// subscriptions when it rises.
    pub fn note_subscribability(&mut self, level: Subscribability) -> Vec<SubscriptionId> {
        let released = if level > self.subscribability {
            let ids: Vec<SubscriptionId> = self
                .subs
                .values_mut()
                .filter(|s| s.awaiting_subscribability)
                .map(|s| {
                    s.awaiting_subscribability = false;
                    s.id
                })
                .collect();
            for id in &ids {
                self.enqueue(*id, RequestKind::Subscribe);
            }
            ids
        } else {
            Vec::new()
        };
        self.subscribability = level;
        released
    }

    /// Bulk-suspends the registry.
    ///
    /// In-flight waits are surfaced for `Offlined` error synthesis; requests
    /// that cannot be retransmitted are dropped outright. Every surviving
    /// subscription returns to `Inactive` for resubscription on the next
    /// online transition.
    pub fn go_offline(&mut self) -> OfflineOutcome {
        self.online = false;
        self.high_queue.clear();
        self.normal_queue.clear();

        let mut outcome = OfflineOutcome::default();
        let mut to_drop = Vec::new();
        for sub in self.subs.values_mut() {
            if sub.pending.take().is_some() {
                if sub.been_sent && !sub.definition.resend_allowed {
                    to_drop.push(sub.id);
                } else {
                    outcome.offlined.push(sub.id);
                }
            }
            sub.status = SubscriptionStatus::Inactive;
            sub.resend_due = None;
        }
        for id in to_drop {
            if let Some(sub) = self.subs.remove(&id) {
                outcome.dropped.push(sub);
            }
        }
        outcome
    }

    /// Bulk-resumes the registry, queueing every eligible subscription.
    pub fn come_online(&mut self) {
        self.online = true;
        let ids: Vec<SubscriptionId> = self
            .subs
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Inactive
                    && s.activated
                    && !s.awaiting_subscribability
            })
            .map(|s| s.id)
            .collect();
        for id in ids {
            let kind = if self.subs[&id].unsubscribe_required {
                RequestKind::Unsubscribe
            } else {
                RequestKind::Subscribe
            };
            self.enqueue(id, kind);
        }
    }

    /// Drains all queues and subscriptions, leaving nothing allocated.
    pub fn finalise(&mut self) {
        self.online = false;
        self.high_queue.clear();
        self.normal_queue.clear();
        self.subs.clear();
    }

    fn enqueue(&mut self, id: SubscriptionId, kind: RequestKind) {
        let Some(sub) = self.subs.get_mut(&id) else {
            return;
        };
        // A non-retransmittable request that has already gone out must never
        // re-enter the queue; reaching this point is a logic error upstream.
        if kind == RequestKind::Subscribe {
            assert!(
                sub.definition.resend_allowed || !sub.been_sent,
                "subscription {id} is not retransmittable but was queued again",
            );
        }
        sub.status = SubscriptionStatus::Queued;
        match sub.definition.priority {
            RequestPriority::High => self.high_queue.push_back(id),
            RequestPriority::Normal => self.normal_queue.push_back(id),
        }
    }

    fn remove_from_queues(&mut self, id: SubscriptionId) {
        self.high_queue.retain(|queued| *queued != id);
        self.normal_queue.retain(|queued| *queued != id);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use ustr::Ustr;

    use super::*;

    fn stream_defn(priority: RequestPriority) -> RequestDefinition {
        RequestDefinition {
            priority,
            ..RequestDefinition::stream(Ustr::from("Trades"), Ustr::from("AAPL.XASX"))
        }
    }

    fn online_registry() -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::new();
        registry.come_online();
        registry
    }

    #[rstest]
    fn test_high_priority_drains_before_normal() {
        let mut registry = online_registry();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        registry.subscribe(SubscriptionId(2), stream_defn(RequestPriority::High));
        registry.subscribe(SubscriptionId(3), stream_defn(RequestPriority::High));

        assert_eq!(registry.pop_sendable(), Some(SubscriptionId(2)));
        assert_eq!(registry.pop_sendable(), Some(SubscriptionId(3)));
        assert_eq!(registry.pop_sendable(), Some(SubscriptionId(1)));
        assert_eq!(registry.pop_sendable(), None);
    }

    #[rstest]
    fn test_no_sends_while_offline() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::High));
        assert_eq!(registry.pop_sendable(), None);
    }

    #[rstest]
    fn test_unsubscribe_before_send_removes() {
        let mut registry = online_registry();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        assert!(matches!(
            registry.unsubscribe(SubscriptionId(1)),
            UnsubscribeOutcome::Removed(_)
        ));
        assert!(registry.is_empty());
        assert_eq!(registry.pop_sendable(), None);
    }

    #[rstest]
    fn test_unsubscribe_after_send_queues_unsub() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        assert!(matches!(
            registry.unsubscribe(id),
            UnsubscribeOutcome::Deactivating
        ));
        let sub = registry.get(id).unwrap();
        assert!(sub.unsubscribe_required);
        assert!(sub.pending.is_none());
        assert_eq!(registry.pop_sendable(), Some(id));
    }

    #[rstest]
    #[should_panic(expected = "not retransmittable")]
    fn test_resend_of_sent_unresendable_panics() {
        let mut registry = online_registry();
        let now = Instant::now();
        let defn = RequestDefinition {
            resend_allowed: false,
            ..RequestDefinition::query(
                Ustr::from("Trading"),
                Ustr::from("PlaceOrder"),
                serde_json::Value::Null,
            )
        };
        registry.subscribe(SubscriptionId(7), defn);
        let id = registry.pop_sendable().unwrap();
        registry.mark_subscribe_sent(
            id,
            CorrelationKey::Transaction(1),
            now + std::time::Duration::from_secs(30),
        );

        // Force the subscription back into a queueable shape, then re-queue.
        registry.get_mut(id).unwrap().status = SubscriptionStatus::Inactive;
        registry.get_mut(id).unwrap().resend_due = Some(now);
        registry.due_retries(now);
    }

    #[rstest]
    fn test_delay_failure_schedules_backoff() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        let disposition = registry.apply_failure(id, AllowedRetry::Delay, now).unwrap();
        assert!(matches!(
            disposition,
            FailureDisposition::Rescheduled(d) if d == std::time::Duration::from_secs(8)
        ));

        // Not due yet.
        assert!(registry.due_retries(now).is_empty());
        let due = registry.due_retries(now + std::time::Duration::from_secs(8));
        assert_eq!(due, vec![id]);
        assert_eq!(registry.pop_sendable(), Some(id));
    }

    #[rstest]
    fn test_never_failure_removes() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        assert!(matches!(
            registry.apply_failure(id, AllowedRetry::Never, now),
            Some(FailureDisposition::Removed(_))
        ));
        assert!(registry.is_empty());
    }

    #[rstest]
    fn test_parked_until_subscribability_rises() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        registry
            .apply_failure(id, AllowedRetry::SubscribabilityIncrease, now)
            .unwrap();
        assert!(registry.due_retries(now + std::time::Duration::from_secs(600)).is_empty());

        let released = registry.note_subscribability(Subscribability::Some);
        assert_eq!(released, vec![id]);
        assert_eq!(registry.pop_sendable(), Some(id));
    }

    #[rstest]
    fn test_offline_fails_in_flight_and_online_requeues() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        let outcome = registry.go_offline();
        assert_eq!(outcome.offlined, vec![id]);
        assert!(outcome.dropped.is_empty());
        assert_eq!(registry.pop_sendable(), None);

        registry.come_online();
        assert_eq!(registry.pop_sendable(), Some(id));
    }

    #[rstest]
    fn test_offline_drops_unresendable_in_flight() {
        let mut registry = online_registry();
        let now = Instant::now();
        let defn = RequestDefinition {
            resend_allowed: false,
            ..RequestDefinition::query(
                Ustr::from("Trading"),
                Ustr::from("PlaceOrder"),
                serde_json::Value::Null,
            )
        };
        registry.subscribe(SubscriptionId(9), defn);
        let id = registry.pop_sendable().unwrap();
        registry.mark_subscribe_sent(
            id,
            CorrelationKey::Transaction(5),
            now + std::time::Duration::from_secs(30),
        );

        let outcome = registry.go_offline();
        assert!(outcome.offlined.is_empty());
        assert_eq!(outcome.dropped.len(), 1);
        assert!(registry.is_empty());
    }

    #[rstest]
    fn test_expired_deadline_surfaced_once() {
        let mut registry = online_registry();
        let now = Instant::now();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::Normal));
        let id = registry.pop_sendable().unwrap();
        let key = registry.get(id).unwrap().topic_key();
        registry.mark_subscribe_sent(id, key, now + std::time::Duration::from_secs(30));

        assert!(registry.expired(now).is_empty());
        let expired = registry.expired(now + std::time::Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, id);
        // Cleared on first surface.
        assert!(registry.expired(now + std::time::Duration::from_secs(60)).is_empty());
    }

    #[rstest]
    fn test_deferred_activation() {
        let mut registry = online_registry();
        registry.subscribe_deferred(SubscriptionId(4), stream_defn(RequestPriority::Normal));
        assert_eq!(registry.pop_sendable(), None);

        registry.activate(SubscriptionId(4), 17);
        assert_eq!(registry.pop_sendable(), Some(SubscriptionId(4)));
        assert_eq!(registry.get(SubscriptionId(4)).unwrap().request_nr, Some(17));
    }

    #[rstest]
    fn test_finalise_leaves_nothing() {
        let mut registry = online_registry();
        registry.subscribe(SubscriptionId(1), stream_defn(RequestPriority::High));
        registry.subscribe(SubscriptionId(2), stream_defn(RequestPriority::Normal));
        registry.finalise();
        assert!(registry.is_empty());
        assert_eq!(registry.pop_sendable(), None);
    }
}
