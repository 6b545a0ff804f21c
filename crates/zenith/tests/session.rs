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

//! Integration tests for the session actor using a channel-backed mock
//! transport.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;
use zenith_client::{
    auth::{AccessTokenProvider, FetchedAccessToken, OwnerCredentials, SessionCredentials},
    common::consts::SESSION_KICKED_OFF_CLOSE_CODE,
    config::ZenithClientConfig,
    events::SessionRecord,
    handler::{ClientCommand, SessionHandler},
    subscription::{RequestDefinition, SubscriptionId},
    transport::{ReadyState, SocketTransport, TransportEvent},
    ZenithWsError, ZenithWsResult,
};

// ------------------------------------------------------------------------------------------------
// Mock transport and token provider
// ------------------------------------------------------------------------------------------------

struct MockTransport {
    event_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    sent_tx: tokio::sync::mpsc::UnboundedSender<String>,
    fail_open: Arc<AtomicBool>,
    open: bool,
}

#[async_trait]
impl SocketTransport for MockTransport {
    async fn open(&mut self, _endpoint: &str) -> ZenithWsResult<()> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(ZenithWsError::Transport("connection refused".to_string()));
        }
        self.open = true;
        let _ = self.event_tx.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&mut self, text: String) -> ZenithWsResult<()> {
        if !self.open {
            return Err(ZenithWsError::NotConnected);
        }
        self.sent_tx
            .send(text)
            .map_err(|e| ZenithWsError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> ZenithWsResult<()> {
        self.open = false;
        let _ = self.event_tx.send(TransportEvent::Closed {
            code: Some(code),
            reason: Some(reason.to_string()),
            clean: true,
        });
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if self.open {
            ReadyState::Open
        } else {
            ReadyState::Closed
        }
    }
}

struct MockTokenProvider {
    calls: Arc<AtomicU32>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl AccessTokenProvider for MockTokenProvider {
    async fn fetch_access_token(&self) -> anyhow::Result<FetchedAccessToken> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("provider unavailable");
        }
        Ok(FetchedAccessToken {
            token: "bearer-token".to_string(),
            expires_in: Duration::from_secs(3600),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Harness
// ------------------------------------------------------------------------------------------------

struct TestSession {
    cmd_tx: tokio::sync::mpsc::UnboundedSender<ClientCommand>,
    out_rx: tokio::sync::mpsc::UnboundedReceiver<SessionRecord>,
    sent_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    event_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    provider_calls: Arc<AtomicU32>,
    task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

fn token_config() -> ZenithClientConfig {
    let mut config = ZenithClientConfig::new(
        "wss://example.test/zenith",
        SessionCredentials::Token {
            provider: "Paritech".to_string(),
        },
    );
    config.tick_interval_ms = 10;
    config
}

fn spawn_session(config: ZenithClientConfig, fail_provider: bool) -> TestSession {
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = tokio::sync::mpsc::unbounded_channel();

    let transport = MockTransport {
        event_tx: event_tx.clone(),
        sent_tx,
        fail_open: Arc::new(AtomicBool::new(false)),
        open: false,
    };
    let provider_calls = Arc::new(AtomicU32::new(0));
    let provider = Arc::new(MockTokenProvider {
        calls: provider_calls.clone(),
        fail: Arc::new(AtomicBool::new(fail_provider)),
    });
    let cancel = CancellationToken::new();

    let handler = SessionHandler::new(
        config,
        transport,
        event_rx,
        Some(provider),
        cmd_rx,
        out_tx,
        Arc::new(AtomicBool::new(false)),
        cancel.clone(),
    );
    let task = tokio::spawn(handler.run());

    TestSession {
        cmd_tx,
        out_rx,
        sent_rx,
        event_tx,
        provider_calls,
        task,
        cancel,
    }
}

async fn recv_frame(session: &mut TestSession) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(2), session.sent_rx.recv())
        .await
        .expect("timed out waiting for outbound frame")
        .expect("sent channel closed");
    serde_json::from_str(&text).expect("outbound frame is not valid JSON")
}

async fn wait_record<F>(session: &mut TestSession, mut predicate: F) -> SessionRecord
where
    F: FnMut(&SessionRecord) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let record = session.out_rx.recv().await.expect("record channel closed");
            if predicate(&record) {
                return record;
            }
        }
    })
    .await
    .expect("timed out waiting for record")
}

fn inject(session: &TestSession, frame: Value) {
    session
        .event_tx
        .send(TransportEvent::Message(frame.to_string()))
        .expect("event channel closed");
}

fn auth_success_reply(transaction_id: u64) -> Value {
    json!({
        "controller": "Auth",
        "topic": "AuthToken",
        "action": "Publish",
        "transactionId": transaction_id,
        "data": {
            "result": "Success",
            "accessToken": "zenith-token",
            "expiresIn": 600,
            "userId": "user-1",
            "displayName": "User One",
            "scope": "trading"
        }
    })
}

/// Drives a fresh session through connect and authentication.
async fn connect_online(session: &mut TestSession) {
    session
        .cmd_tx
        .send(ClientCommand::Connect)
        .expect("command channel closed");

    let auth_frame = recv_frame(session).await;
    assert_eq!(auth_frame["controller"], "Auth");
    assert_eq!(auth_frame["topic"], "AuthToken");
    assert_eq!(auth_frame["data"]["accessToken"], "bearer-token");

    let tx_id = auth_frame["transactionId"].as_u64().expect("auth tx id");
    inject(session, auth_success_reply(tx_id));

    wait_record(session, |r| {
        matches!(r, SessionRecord::OnlineChanged { online: true, .. })
    })
    .await;
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_token_flow_comes_online() {
    let mut session = spawn_session(token_config(), false);
    connect_online(&mut session).await;
    assert_eq!(session.provider_calls.load(Ordering::Relaxed), 1);
    session.cancel.cancel();
}

#[tokio::test]
async fn test_subscribe_confirm_and_data_flow() {
    let mut session = spawn_session(token_config(), false);
    connect_online(&mut session).await;

    let id = SubscriptionId(1);
    session
        .cmd_tx
        .send(ClientCommand::Subscribe {
            id,
            definition: RequestDefinition::stream(Ustr::from("Trades"), Ustr::from("AAPL.XASX")),
        })
        .unwrap();

    let sub_frame = recv_frame(&mut session).await;
    assert_eq!(sub_frame["controller"], "Trades");
    assert_eq!(sub_frame["topic"], "AAPL.XASX");
    assert_eq!(sub_frame["action"], "Sub");

    inject(
        &session,
        json!({"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub", "confirm": true}),
    );
    wait_record(&mut session, |r| {
        matches!(
            r,
            SessionRecord::Synchronised { subscription, already_unsubscribed: false }
                if *subscription == id
        )
    })
    .await;

    inject(
        &session,
        json!({
            "controller": "Trades",
            "topic": "AAPL.XASX",
            "action": "Sub",
            "data": {"price": 31.5, "quantity": 100}
        }),
    );
    let record = wait_record(&mut session, |r| {
        matches!(r, SessionRecord::Payload { .. })
    })
    .await;
    if let SessionRecord::Payload { subscription, envelope } = record {
        assert_eq!(subscription, id);
        assert_eq!(envelope.data["price"], 31.5);
    }
    session.cancel.cancel();
}

#[tokio::test]
async fn test_publish_reply_matches_only_its_transaction_id() {
    let mut session = spawn_session(token_config(), false);
    connect_online(&mut session).await;

    let id = SubscriptionId(1);
    session
        .cmd_tx
        .send(ClientCommand::Subscribe {
            id,
            definition: RequestDefinition::query(
                Ustr::from("Market"),
                Ustr::from("QueryMarkets"),
                json!({"exchange": "XASX"}),
            ),
        })
        .unwrap();

    let frame = recv_frame(&mut session).await;
    let tx_id = frame["transactionId"].as_u64().expect("publish tx id");

    // A mismatched transaction id must not complete the request.
    inject(
        &session,
        json!({
            "controller": "Market",
            "topic": "QueryMarkets",
            "transactionId": tx_id + 100,
            "data": {"markets": []}
        }),
    );
    // The matching one does.
    inject(
        &session,
        json!({
            "controller": "Market",
            "topic": "QueryMarkets",
            "transactionId": tx_id,
            "data": {"markets": ["XASX"]}
        }),
    );

    let mut payloads = 0;
    let record = wait_record(&mut session, |r| {
        if matches!(r, SessionRecord::Payload { .. }) {
            payloads += 1;
        }
        matches!(r, SessionRecord::Synchronised { .. })
    })
    .await;
    assert_eq!(payloads, 1);
    assert!(matches!(
        record,
        SessionRecord::Synchronised { already_unsubscribed: false, .. }
    ));
    session.cancel.cancel();
}

#[tokio::test]
async fn test_unexpected_close_reconnects_and_resubscribes() {
    let mut session = spawn_session(token_config(), false);
    connect_online(&mut session).await;

    let id = SubscriptionId(1);
    session
        .cmd_tx
        .send(ClientCommand::Subscribe {
            id,
            definition: RequestDefinition::stream(Ustr::from("Trades"), Ustr::from("AAPL.XASX")),
        })
        .unwrap();
    let _ = recv_frame(&mut session).await;
    inject(
        &session,
        json!({"controller": "Trades", "topic": "AAPL.XASX", "action": "Sub", "confirm": true}),
    );

    // Server drops the socket.
    session
        .event_tx
        .send(TransportEvent::Closed {
            code: Some(1006),
            reason: Some("abnormal".to_string()),
            clean: false,
        })
        .unwrap();

    wait_record(&mut session, |r| {
        matches!(r, SessionRecord::OnlineChanged { online: false, close_code: Some(1006), .. })
    })
    .await;

    // The cached access token is fresh, so the engine reopens the socket and
    // re-authenticates without a second provider round-trip.
    let auth_frame = recv_frame(&mut session).await;
    assert_eq!(auth_frame["controller"], "Auth");
    let tx_id = auth_frame["transactionId"].as_u64().unwrap();
    inject(&session, auth_success_reply(tx_id));

    wait_record(&mut session, |r| {
        matches!(r, SessionRecord::OnlineChanged { online: true, .. })
    })
    .await;
    assert_eq!(session.provider_calls.load(Ordering::Relaxed), 1);

    // The streaming subscription resubscribes automatically.
    let resub = recv_frame(&mut session).await;
    assert_eq!(resub["topic"], "AAPL.XASX");
    assert_eq!(resub["action"], "Sub");
    session.cancel.cancel();
}

#[tokio::test]
async fn test_session_kicked_off_finalises() {
    let mut session = spawn_session(token_config(), false);
    connect_online(&mut session).await;

    session
        .event_tx
        .send(TransportEvent::Closed {
            code: Some(SESSION_KICKED_OFF_CLOSE_CODE),
            reason: Some("logged in elsewhere".to_string()),
            clean: true,
        })
        .unwrap();

    wait_record(&mut session, |r| matches!(r, SessionRecord::SessionKickedOff)).await;

    // The actor winds down without reconnecting.
    tokio::time::timeout(Duration::from_secs(2), session.task)
        .await
        .expect("actor did not stop")
        .expect("actor panicked");
    assert_eq!(session.provider_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_owner_flow_rejection_finalises() {
    let mut config = ZenithClientConfig::new(
        "wss://example.test/zenith",
        SessionCredentials::Owner(OwnerCredentials {
            provider: "Paritech".to_string(),
            client_id: "client".to_string(),
            username: "user".to_string(),
            password: "wrong".to_string(),
        }),
    );
    config.tick_interval_ms = 10;
    let mut session = spawn_session(config, false);

    session.cmd_tx.send(ClientCommand::Connect).unwrap();

    let auth_frame = recv_frame(&mut session).await;
    assert_eq!(auth_frame["topic"], "AuthOwner");
    assert_eq!(auth_frame["data"]["username"], "user");
    let tx_id = auth_frame["transactionId"].as_u64().unwrap();

    inject(
        &session,
        json!({
            "controller": "Auth",
            "topic": "AuthOwner",
            "action": "Publish",
            "transactionId": tx_id,
            "data": {"result": "Failure", "accessToken": "", "expiresIn": 0}
        }),
    );

    // Rejected owner credentials are unrecoverable.
    tokio::time::timeout(Duration::from_secs(2), session.task)
        .await
        .expect("actor did not stop")
        .expect("actor panicked");
    assert_eq!(session.provider_calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_provider_failure_schedules_reconnect() {
    let mut session = spawn_session(token_config(), true);
    session.cmd_tx.send(ClientCommand::Connect).unwrap();

    wait_record(&mut session, |r| {
        matches!(r, SessionRecord::LogLine(text) if text.contains("access token fetch failed"))
    })
    .await;
    wait_record(&mut session, |r| {
        matches!(
            r,
            SessionRecord::Reconnected { .. }
        )
    })
    .await;
    session.cancel.cancel();
}
