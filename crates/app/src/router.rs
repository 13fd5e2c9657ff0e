use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use hookrelay_util::WebhookSettings;

use crate::dead_letter::DeadLetterSink;
use crate::idempotency::IdempotencyStore;
use crate::problem::ProblemResponse;
use crate::queue::InboundQueue;
use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::{telemetry, webhook};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    webhook_secret: Arc<[u8]>,
    event_id_pointer: Arc<str>,
    event_type_pointer: Arc<str>,
    store: Arc<dyn IdempotencyStore>,
    queue: InboundQueue,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        webhook: &WebhookSettings,
        store: Arc<dyn IdempotencyStore>,
        queue: InboundQueue,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            metrics,
            tap,
            webhook_secret: Arc::from(webhook.secret.as_slice()),
            event_id_pointer: Arc::from(webhook.event_id_pointer.as_str()),
            event_type_pointer: Arc::from(webhook.event_type_pointer.as_str()),
            store,
            queue,
            dead_letters,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn webhook_secret(&self) -> Arc<[u8]> {
        self.webhook_secret.clone()
    }

    pub fn event_id_pointer(&self) -> &str {
        &self.event_id_pointer
    }

    pub fn event_type_pointer(&self) -> &str {
        &self.event_type_pointer
    }

    pub fn store(&self) -> &dyn IdempotencyStore {
        self.store.as_ref()
    }

    pub fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    pub fn dead_letters(&self) -> &dyn DeadLetterSink {
        self.dead_letters.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/tap", get(debug_tap))
        .route("/admin/dead-letters", get(dead_letters))
        .route("/admin/events/:event_id", get(event_status))
        .route("/webhook", post(webhook::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Response, ProblemResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);

    let stored = state.dead_letters().recent(limit).await.map_err(|err| {
        error!(stage = "dead_letter", error = %err, "failed to list dead letters");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dead_letter_unavailable",
            "failed to load dead letters",
        )
    })?;

    let items: Vec<Value> = stored
        .into_iter()
        .map(|stored| {
            let letter = stored.letter;
            json!({
                "id": stored.id,
                "event": letter.event.redacted(),
                "attempts": letter.attempts,
                "kind": letter.kind,
                "last_error": letter.last_error,
                "dead_lettered_at": letter.dead_lettered_at,
            })
        })
        .collect();

    Ok(Json(json!({ "items": items, "limit": limit })).into_response())
}

/// Idempotency record for one event id: whether it is still pending or has
/// reached a terminal outcome.
async fn event_status(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let record = state.store().get(&event_id).await.map_err(|err| {
        error!(stage = "idempotency", event_id = %event_id, error = %err, "failed to load record");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "idempotency_unavailable",
            "failed to load idempotency record",
        )
    })?;

    match record {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "event_not_found",
            format!("no record for event id {event_id}"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{dead_letter::MemoryDeadLetterSink, idempotency::MemoryIdempotencyStore};

    pub const SECRET: &[u8] = b"test-secret";

    pub struct TestApp {
        pub state: AppState,
        pub store: Arc<dyn IdempotencyStore>,
        pub queue: InboundQueue,
        pub dead_letters: Arc<MemoryDeadLetterSink>,
    }

    pub fn test_app(queue_capacity: usize) -> TestApp {
        test_app_with_store(queue_capacity, Arc::new(MemoryIdempotencyStore::new()))
    }

    pub fn test_app_with_store(queue_capacity: usize, store: Arc<dyn IdempotencyStore>) -> TestApp {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let queue = InboundQueue::new(queue_capacity);
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let settings = WebhookSettings {
            secret: SECRET.to_vec(),
            event_id_pointer: "/id".into(),
            event_type_pointer: "/event".into(),
        };
        let state = AppState::new(
            metrics,
            TapHub::new(),
            &settings,
            store.clone(),
            queue.clone(),
            dead_letters.clone(),
        );
        TestApp {
            state,
            store,
            queue,
            dead_letters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_app;
    use super::*;
    use axum::http::Request;
    use hookrelay_core::types::{DeadLetter, DeadLetterKind, InboundEvent};
    use http_body_util::BodyExt;
    use tokio::time::{self, Duration};
    use tower::ServiceExt;

    use crate::tap::StageEvent;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(test_app(4).state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(test_app(4).state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn dead_letters_are_listed_newest_first_without_payload() {
        let test = test_app(4);
        for id in ["evt-a", "evt-b"] {
            test.dead_letters
                .record(DeadLetter {
                    event: InboundEvent::new(id, b"{\"card\":\"4111\"}".to_vec(), Utc::now(), "sha256=00"),
                    attempts: 5,
                    kind: DeadLetterKind::RetriesExhausted,
                    last_error: "downstream 503".into(),
                    dead_lettered_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let (status, body) = get_json(app_router(test.state.clone()), "/admin/dead-letters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 50);
        let items = body["items"].as_array().expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["event"]["event_id"], "evt-b");
        assert_eq!(items[0]["kind"], "retries_exhausted");
        assert!(!body.to_string().contains("4111"));

        let (_, limited) = get_json(app_router(test.state), "/admin/dead-letters?limit=1").await;
        assert_eq!(limited["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_limit_is_capped() {
        let (status, body) =
            get_json(app_router(test_app(4).state), "/admin/dead-letters?limit=10000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 500);
    }

    #[tokio::test]
    async fn event_status_reports_recorded_outcome() {
        let test = test_app(4);
        test.store.check_and_record("evt-seen", Utc::now()).await.unwrap();

        let (status, body) =
            get_json(app_router(test.state.clone()), "/admin/events/evt-seen").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event_id"], "evt-seen");
        assert_eq!(body["outcome"], "pending");

        let (status, body) = get_json(app_router(test.state), "/admin/events/evt-unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "event_not_found");
    }

    #[tokio::test]
    async fn tap_rejects_unknown_stage() {
        let response = app_router(test_app(4).state)
            .oneshot(
                Request::builder()
                    .uri("/_debug/tap?s=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tap_stream_emits_events() {
        let state = test_app(4).state;
        let tap = state.tap().clone();
        let app = app_router(state);

        let request = Request::builder()
            .uri("/_debug/tap")
            .body(Body::empty())
            .unwrap();

        let publish = tokio::spawn(async move {
            time::sleep(Duration::from_millis(25)).await;
            tap.publish(StageEvent::mock("test.event"));
        });

        let mut response = app.oneshot(request).await.expect("handler should respond");

        let frame = time::timeout(Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");

        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("data:"));
        assert!(text.contains("\"stage\":\"ingress\""));

        publish.await.expect("publish task");
    }
}
