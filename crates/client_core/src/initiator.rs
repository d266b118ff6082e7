//! Session initiation and producer selection.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::SessionId,
    error::ApiError,
    protocol::{AnalyzeRequest, AnalyzeResponse},
};
use tracing::{info, warn};

use crate::{
    config::{ClientSettings, ProducerMode},
    error::{ClientError, Result},
    simulator::SimulatedProducer,
    transport::{self, EventSource},
};

/// Something that can start an analysis session and stream its events.
#[async_trait]
pub trait SessionProducer: Send + Sync {
    async fn initiate(&self, topic: &str) -> Result<SessionId>;
    async fn connect(&self, session_id: &SessionId) -> Result<EventSource>;
}

pub struct LiveProducer {
    http: Client,
    api_base_url: String,
    ws_base_url: String,
}

impl LiveProducer {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| ClientError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            ws_base_url: settings.ws_base_url.clone(),
        })
    }
}

#[async_trait]
impl SessionProducer for LiveProducer {
    async fn initiate(&self, topic: &str) -> Result<SessionId> {
        let res = self
            .http
            .post(format!("{}/analyze", self.api_base_url))
            .json(&AnalyzeRequest {
                topic: topic.to_string(),
            })
            .send()
            .await
            .map_err(|err| ClientError::Initiation(format!("request failed: {err}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ApiError>(&body) {
                Ok(api_error) => api_error.message,
                Err(_) => body,
            };
            warn!(%status, %detail, "initiator: analyze request rejected");
            let mut message = format!("HTTP error! status: {}", status.as_u16());
            if !detail.trim().is_empty() {
                message.push_str(": ");
                message.push_str(detail.trim());
            }
            return Err(ClientError::Initiation(message));
        }

        let body: AnalyzeResponse = res
            .json()
            .await
            .map_err(|err| ClientError::Initiation(format!("invalid analyze response: {err}")))?;
        if body.session_id.as_str().is_empty() {
            return Err(ClientError::Initiation(
                "analyze response carried an empty session id".to_string(),
            ));
        }
        info!(session_id = %body.session_id, "initiator: session created");
        Ok(body.session_id)
    }

    async fn connect(&self, session_id: &SessionId) -> Result<EventSource> {
        transport::connect(&self.ws_base_url, session_id).await
    }
}

/// Hands sessions to the producer chosen by an explicit mode.
#[derive(Clone)]
pub struct SessionInitiator {
    producer: Arc<dyn SessionProducer>,
    mode: ProducerMode,
}

impl SessionInitiator {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let producer: Arc<dyn SessionProducer> = match settings.mode {
            ProducerMode::Live => Arc::new(LiveProducer::new(settings)?),
            ProducerMode::Simulated => {
                Arc::new(SimulatedProducer::from_settings(&settings.simulation)?)
            }
        };
        info!(mode = ?settings.mode, "initiator: producer selected");
        Ok(Self {
            producer,
            mode: settings.mode,
        })
    }

    pub fn with_producer(producer: Arc<dyn SessionProducer>, mode: ProducerMode) -> Self {
        Self { producer, mode }
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    pub async fn initiate(&self, topic: &str) -> Result<SessionId> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ClientError::InvalidTopic);
        }
        self.producer.initiate(topic).await
    }

    pub async fn connect(&self, session_id: &SessionId) -> Result<EventSource> {
        self.producer.connect(session_id).await
    }
}

#[cfg(test)]
#[path = "tests/initiator_tests.rs"]
mod tests;
