use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use hookrelay_core::{
    identity::{extract_event_type, resolve_event_id},
    signature,
    types::{CheckOutcome, InboundEvent},
};

use crate::handler::{EVENT_ID_HEADER, SIGNATURE_HEADER};
use crate::problem::ProblemResponse;
use crate::queue::EnqueueError;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata};

const RETRY_AFTER_QUEUE_FULL_SECS: u64 = 1;
const RETRY_AFTER_SHUTDOWN_SECS: u64 = 30;

/// `POST /webhook`: verify, deduplicate, enqueue, acknowledge.
///
/// The response never waits on the event handler.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = process(&state, &headers, body).await;

    let (label, status) = match &result {
        Ok(ack) => (ack.label(), StatusCode::OK),
        Err(rejection) => (rejection.label, rejection.problem.status()),
    };
    let elapsed = start.elapsed().as_secs_f64();
    counter!("webhook_ingress_total", "result" => label).increment(1);
    histogram!("webhook_ack_latency_seconds", "result" => label).record(elapsed);

    let (event_id, size_bytes, event_type) = match &result {
        Ok(ack) => (
            Some(ack.event_id().to_string()),
            ack.size_bytes(),
            ack.event_type(),
        ),
        Err(rejection) => (rejection.event_id.clone(), rejection.size_bytes, None),
    };
    let mut tap_event = StageEvent::new(StageKind::Ingress, state.now())
        .with_meta(StageMetadata {
            event_type,
            size_bytes: Some(size_bytes),
            latency_ms: Some(elapsed * 1000.0),
            ..StageMetadata::default()
        })
        .with_out(json!({ "result": label, "status": status.as_u16() }));
    if let Some(event_id) = event_id {
        tap_event = tap_event.with_event_id(event_id);
    }
    state.tap().publish(tap_event);

    match result {
        Ok(ack) => Ok(ack.into_response()),
        Err(rejection) => Err(rejection.problem),
    }
}

enum Ack {
    Accepted {
        event_id: String,
        event_type: Option<String>,
        size_bytes: u64,
    },
    Duplicate {
        event_id: String,
        size_bytes: u64,
    },
}

impl Ack {
    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Duplicate { .. } => "duplicate",
        }
    }

    fn event_id(&self) -> &str {
        match self {
            Self::Accepted { event_id, .. } | Self::Duplicate { event_id, .. } => event_id,
        }
    }

    fn size_bytes(&self) -> u64 {
        match self {
            Self::Accepted { size_bytes, .. } | Self::Duplicate { size_bytes, .. } => *size_bytes,
        }
    }

    fn event_type(&self) -> Option<String> {
        match self {
            Self::Accepted { event_type, .. } => event_type.clone(),
            Self::Duplicate { .. } => None,
        }
    }
}

impl IntoResponse for Ack {
    fn into_response(self) -> Response {
        let body = match self {
            Self::Accepted { event_id, .. } => json!({ "status": "accepted", "event_id": event_id }),
            Self::Duplicate { .. } => json!({ "status": "duplicate" }),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

struct Rejection {
    label: &'static str,
    event_id: Option<String>,
    size_bytes: u64,
    problem: ProblemResponse,
}

async fn process(state: &AppState, headers: &HeaderMap, body: Bytes) -> Result<Ack, Rejection> {
    let size_bytes = body.len() as u64;
    let signature_header = header_str(headers, SIGNATURE_HEADER);

    let secret = state.webhook_secret();
    if let Some(reason) = signature::verify(&secret, &body, signature_header).failure() {
        counter!("webhook_invalid_signature_total", "reason" => reason.metric_label()).increment(1);
        warn!(
            stage = "ingress",
            reason = reason.metric_label(),
            size_bytes,
            "webhook signature rejected"
        );
        return Err(Rejection {
            label: "invalid_signature",
            event_id: None,
            size_bytes,
            problem: ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                reason.to_string(),
            ),
        });
    }

    let identity = resolve_event_id(
        header_str(headers, EVENT_ID_HEADER),
        &body,
        state.event_id_pointer(),
    );
    let event_id = identity.id;
    let now = state.now();

    match state.store().check_and_record(&event_id, now).await {
        Ok(CheckOutcome::New) => {}
        Ok(CheckOutcome::Duplicate) => {
            info!(stage = "ingress", %event_id, "duplicate delivery acknowledged");
            return Ok(Ack::Duplicate {
                event_id,
                size_bytes,
            });
        }
        Err(err) => {
            error!(stage = "ingress", %event_id, error = %err, "idempotency check failed");
            return Err(Rejection {
                label: "store_error",
                event_id: Some(event_id),
                size_bytes,
                problem: ProblemResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "idempotency_unavailable",
                    "failed to record event",
                ),
            });
        }
    }

    let event_type = extract_event_type(&body, state.event_type_pointer());
    let event = InboundEvent::new(
        event_id.clone(),
        body.to_vec(),
        now,
        signature_header.unwrap_or_default(),
    )
    .with_event_type(event_type.clone());

    match state.queue().enqueue(event) {
        Ok(depth) => {
            info!(
                stage = "ingress",
                %event_id,
                id_source = identity.source.as_str(),
                event_type = event_type.as_deref().unwrap_or("unknown"),
                size_bytes,
                depth,
                "event accepted"
            );
            Ok(Ack::Accepted {
                event_id,
                event_type,
                size_bytes,
            })
        }
        Err(err) => {
            // The sender will redeliver, so the id must not look seen.
            if let Err(release_err) = state.store().release(&event_id).await {
                error!(
                    stage = "ingress",
                    %event_id,
                    error = %release_err,
                    "failed to release rejected event id"
                );
            }
            let (label, problem) = match err {
                EnqueueError::Full { capacity } => (
                    "queue_full",
                    ProblemResponse::new(
                        StatusCode::TOO_MANY_REQUESTS,
                        "queue_full",
                        format!("inbound queue is at capacity ({capacity})"),
                    )
                    .with_retry_after(RETRY_AFTER_QUEUE_FULL_SECS),
                ),
                EnqueueError::Closed => (
                    "shutting_down",
                    ProblemResponse::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "shutting_down",
                        "receiver is shutting down",
                    )
                    .with_retry_after(RETRY_AFTER_SHUTDOWN_SECS),
                ),
            };
            warn!(stage = "ingress", %event_id, reason = label, "event rejected by backpressure");
            Err(Rejection {
                label,
                event_id: Some(event_id),
                size_bytes,
                problem,
            })
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
