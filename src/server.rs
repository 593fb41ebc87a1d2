use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use subtle::ConstantTimeEq;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::bot::Dispatcher;
use crate::platform::telegram::{classify, Update};

/// Header Telegram fills with the `secret_token` given to `setWebhook`
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub audit: Arc<dyn AuditSink>,
    pub webhook_secret: Arc<str>,
}

/// The timeout covers the health route only. A webhook call runs to completion
/// so an update is never half-dispatched and then redelivered.
pub fn build_app(state: AppState, webhook_path: &str, request_timeout_secs: u64) -> Router {
    let health_routes = Router::new().route("/", get(health)).layer(
        TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ),
    );

    Router::new()
        .route(webhook_path, post(webhook))
        .with_state(state)
        .merge(health_routes)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Once the secret matches, the answer is always 200 "ok". Telegram retries
/// anything else, and a retry cannot fix a bad payload or a downstream outage.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let secret = headers
        .get(SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !bool::from(secret.ct_eq(state.webhook_secret.as_bytes())) {
        warn!("Rejected webhook call: secret token mismatch");
        return (StatusCode::FORBIDDEN, "forbidden");
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Webhook body is not JSON: {}", e);
            return (StatusCode::OK, "ok");
        }
    };
    let update: Update = match serde_json::from_value(raw.clone()) {
        Ok(update) => update,
        Err(e) => {
            warn!("Webhook body is not a Telegram update: {}", e);
            return (StatusCode::OK, "ok");
        }
    };

    let record = AuditRecord::from_update(&update, raw);
    let audit = state.audit.clone();
    tokio::spawn(async move {
        if let Err(e) = audit.record(&record).await {
            warn!("Failed to record update: {:#}", e);
        }
    });

    let classified = classify(&update);
    debug!("Update {}: {:?}", update.update_id, classified);

    let report = state.dispatcher.dispatch(classified).await;
    debug!(
        "Update {} handled: {} delivered, {} failed",
        update.update_id, report.delivered, report.failed
    );

    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::tests::{content, Event, FakeMessenger, FakeOracle, Journal};
    use crate::subscription::MembershipStatus;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct ChannelAudit {
        tx: mpsc::UnboundedSender<AuditRecord>,
        fail: bool,
    }

    #[async_trait]
    impl AuditSink for ChannelAudit {
        async fn record(&self, record: &AuditRecord) -> Result<()> {
            let _ = self.tx.send(record.clone());
            if self.fail {
                anyhow::bail!("supabase unavailable");
            }
            Ok(())
        }
    }

    struct Harness {
        app: Router,
        journal: Journal,
        audited: mpsc::UnboundedReceiver<AuditRecord>,
    }

    fn harness(fail_downstream: bool) -> Harness {
        let journal = Journal::default();
        let messenger = FakeMessenger {
            journal: journal.clone(),
            fail_all: fail_downstream,
            fail_documents: false,
        };
        let oracle = FakeOracle {
            journal: journal.clone(),
            status: if fail_downstream {
                None
            } else {
                Some(MembershipStatus::Member)
            },
        };
        let (tx, audited) = mpsc::unbounded_channel();
        let state = AppState {
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(messenger),
                Arc::new(oracle),
                content(),
            )),
            audit: Arc::new(ChannelAudit {
                tx,
                fail: fail_downstream,
            }),
            webhook_secret: Arc::from("s3cret"),
        };
        Harness {
            app: build_app(state, "/tg-webhook", 5),
            journal,
            audited,
        }
    }

    fn post(secret: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/tg-webhook")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn start_update() -> String {
        json!({
            "update_id": 100,
            "message": {
                "message_id": 1,
                "date": 1700000000,
                "chat": { "id": 555, "type": "private" },
                "from": { "id": 42, "is_bot": false, "first_name": "Anna" },
                "text": "/start"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(false);
        let response = h
            .app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_missing_secret_rejected() {
        let mut h = harness(false);
        let response = h.app.oneshot(post(None, start_update())).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.journal.lock().unwrap().is_empty());
        assert!(h.audited.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let h = harness(false);
        let response = h
            .app
            .oneshot(post(Some("guess"), start_update()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_dispatched_and_audited() {
        let mut h = harness(false);
        let response = h
            .app
            .oneshot(post(Some("s3cret"), start_update()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");

        let events = h.journal.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Text { chat_id: 555, keyboard: Some(_), .. }));

        let record = h.audited.recv().await.unwrap();
        assert_eq!(record.chat_id, 555);
        assert_eq!(record.user_id, 42);
        assert_eq!(record.text, "/start");
        assert_eq!(record.raw["message"]["from"]["first_name"], "Anna");
    }

    #[tokio::test]
    async fn test_acknowledged_when_everything_downstream_fails() {
        let mut h = harness(true);
        let body = json!({
            "update_id": 101,
            "callback_query": {
                "id": "cb-9",
                "from": { "id": 42 },
                "message": { "message_id": 3, "chat": { "id": 555 } },
                "data": "check_sub"
            }
        })
        .to_string();

        let response = h.app.oneshot(post(Some("s3cret"), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");

        let events = h.journal.lock().unwrap().clone();
        assert_eq!(events[0], Event::Answer("cb-9".to_string()));
        assert!(events.contains(&Event::Lookup(42)));
        assert!(h.audited.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_garbage_body_acknowledged() {
        let h = harness(false);
        let response = h
            .app
            .oneshot(post(Some("s3cret"), "{not json".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_update_kind_acknowledged_silently() {
        let mut h = harness(false);
        let body = json!({ "update_id": 7, "my_chat_member": { "chat": { "id": 1 } } }).to_string();
        let response = h.app.oneshot(post(Some("s3cret"), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.journal.lock().unwrap().is_empty());

        let record = h.audited.recv().await.unwrap();
        assert_eq!((record.chat_id, record.user_id), (0, 0));
    }

    /// Takes `delay` per call and counts completed sends
    struct SlowMessenger {
        delay: Duration,
        completed: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl SlowMessenger {
        async fn finish(&self) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.completed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl crate::platform::Messenger for SlowMessenger {
        async fn send_text(
            &self,
            _chat_id: i64,
            _text: &str,
            _keyboard: Option<&crate::platform::Keyboard>,
        ) -> Result<()> {
            self.finish().await
        }

        async fn send_document(
            &self,
            _chat_id: i64,
            _document_url: &str,
            _caption: Option<&str>,
        ) -> Result<()> {
            self.finish().await
        }

        async fn answer_callback(&self, _callback_id: &str) -> Result<()> {
            self.finish().await
        }
    }

    #[tokio::test]
    async fn test_slow_dispatch_outlives_request_timeout() {
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let messenger = SlowMessenger {
            delay: Duration::from_millis(400),
            completed: completed.clone(),
        };
        let oracle = FakeOracle {
            journal: Journal::default(),
            status: Some(MembershipStatus::Member),
        };
        let (tx, _audited) = mpsc::unbounded_channel();
        let state = AppState {
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(messenger),
                Arc::new(oracle),
                content(),
            )),
            audit: Arc::new(ChannelAudit { tx, fail: false }),
            webhook_secret: Arc::from("s3cret"),
        };
        // Three sends at 400 ms each run past the 1 s timeout
        let app = build_app(state, "/tg-webhook", 1);
        let body = json!({
            "update_id": 102,
            "callback_query": {
                "id": "cb-slow",
                "from": { "id": 42 },
                "message": { "message_id": 3, "chat": { "id": 555 } },
                "data": "check_sub"
            }
        })
        .to_string();

        let response = app.oneshot(post(Some("s3cret"), body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
        assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_secret_prefix_rejected() {
        let h = harness(false);
        let response = h
            .app
            .oneshot(post(Some("s3cre"), start_update()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.journal.lock().unwrap().is_empty());
    }
}
