use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::info;
use url::Url;

use hookrelay_core::{signature, types::InboundEvent};

pub const EVENT_ID_HEADER: &str = "Webhook-Id";
pub const SIGNATURE_HEADER: &str = "Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "Webhook-Event-Type";

/// Failure reported by a handler.
///
/// Transient failures are retried with backoff; permanent ones go straight to
/// the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

/// Application logic run for every accepted event. Invoked at least once per
/// event; implementations must tolerate repeats.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError>;
}

/// Default handler: records the event and succeeds.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        info!(
            stage = "dispatch",
            event_id = %event.id,
            event_type = %event.type_label(),
            size_bytes = event.payload.len(),
            "event handled"
        );
        Ok(())
    }
}

/// Relays the verified payload to a downstream URL, re-signed with the same secret.
#[derive(Clone)]
pub struct ForwardingHandler {
    client: Client,
    url: Url,
    secret: Arc<[u8]>,
}

impl ForwardingHandler {
    pub fn new(url: Url, secret: Arc<[u8]>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            secret,
        })
    }
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(EVENT_ID_HEADER, &event.id)
            .body(event.payload.to_vec());
        if let Some(signature) = signature::sign(&self.secret, &event.payload) {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        if let Some(event_type) = &event.event_type {
            request = request.header(EVENT_TYPE_HEADER, event_type);
        }

        let response = request
            .send()
            .await
            .map_err(|err| HandlerError::Transient(format!("forward request failed: {err}")))?;
        classify_status(response.status())
    }
}

fn classify_status(status: StatusCode) -> Result<(), HandlerError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("downstream responded with {status}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(HandlerError::Transient(message))
    } else {
        Err(HandlerError::Permanent(message))
    }
}
