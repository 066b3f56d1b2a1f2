use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{Client, StatusCode, Url};

use super::{EventSender, SendError, SenderFactory};
use crate::scenario::TelemetryEvent;

const EVENT_TYPE_HEADER: &str = "x-event-type";
const SENT_AT_HEADER: &str = "x-sent-at";

/// Posts events as JSON to an HTTP ingestion endpoint.
///
/// `429 Too Many Requests`, `503 Service Unavailable` and request timeouts are
/// reported as backpressure; any other non-success status is a fault.
pub struct HttpSender {
    client: Client,
    endpoint: Url,
    slot: usize,
    closed: AtomicBool,
}

impl HttpSender {
    pub fn new(endpoint: Url, timeout: Duration, slot: usize) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("devsim/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SendError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            slot,
            closed: AtomicBool::new(false),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl EventSender for HttpSender {
    async fn send(&self, event: &TelemetryEvent) -> Result<bool, SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        let body = serde_json::to_vec(event).map_err(|e| SendError::Encoding(e.to_string()))?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_TYPE_HEADER, event.event_type())
            .header(SENT_AT_HEADER, chrono::Utc::now().to_rfc3339())
            .body(body)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                tracing::debug!(slot = self.slot, "ingestion request timed out");
                return Ok(false);
            }
            Err(err) => return Err(SendError::Transport(err.to_string())),
        };
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                tracing::debug!(
                    slot = self.slot,
                    status = %response.status(),
                    "ingestion endpoint is throttling"
                );
                Ok(false)
            }
            status => Err(SendError::Rejected(status.as_u16())),
        }
    }

    async fn close(&self) -> Result<(), SendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SendError::Closed);
        }
        tracing::debug!(slot = self.slot, endpoint = %self.endpoint, "closed http sender");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpSenderFactory {
    endpoint: Url,
    timeout: Duration,
}

impl HttpSenderFactory {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SendError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| SendError::Configuration(format!("invalid endpoint `{endpoint}`: {e}")))?;
        Ok(Self { endpoint, timeout })
    }
}

impl SenderFactory for HttpSenderFactory {
    type Sender = HttpSender;

    fn create(&self, slot: usize) -> Result<HttpSender, SendError> {
        HttpSender::new(self.endpoint.clone(), self.timeout, slot)
    }
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;
    use crate::{device::DeviceState, scenario::Reading};

    fn event() -> TelemetryEvent {
        TelemetryEvent::new(&DeviceState::new("host-0".into(), 1), Reading::Heartbeat)
    }

    fn sender(server: &Server) -> HttpSender {
        HttpSenderFactory::new(&server.url_str("/events"), Duration::from_secs(5))
            .unwrap()
            .create(0)
            .unwrap()
    }

    #[tokio::test]
    async fn delivered_on_success_status() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/events"))
                .respond_with(status_code(202)),
        );
        assert!(sender(&server).send(&event()).await.unwrap());
    }

    #[tokio::test]
    async fn throttling_statuses_are_backpressure() {
        for status in [429, 503] {
            let server = Server::run();
            server.expect(
                Expectation::matching(request::method_path("POST", "/events"))
                    .respond_with(status_code(status)),
            );
            assert!(!sender(&server).send(&event()).await.unwrap(), "{status}");
        }
    }

    #[tokio::test]
    async fn other_statuses_are_faults() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/events"))
                .respond_with(status_code(500)),
        );
        let err = sender(&server).send(&event()).await.unwrap_err();
        assert!(matches!(err, SendError::Rejected(500)));
    }

    #[tokio::test]
    async fn closed_sender_refuses_events() {
        let server = Server::run();
        let sender = sender(&server);
        sender.close().await.unwrap();
        assert!(matches!(
            sender.send(&event()).await,
            Err(SendError::Closed)
        ));
        assert!(matches!(sender.close().await, Err(SendError::Closed)));
    }

    #[test]
    fn malformed_endpoint_is_a_configuration_error() {
        let err = HttpSenderFactory::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SendError::Configuration(_)));
    }
}
