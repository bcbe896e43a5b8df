use std::time::Duration;

use serde::Serialize;

use crate::config::Config;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow webhook is not configured")]
    Unconfigured,
    #[error("workflow webhook timed out")]
    Timeout,
    #[error("workflow webhook returned {status}")]
    Status { status: u16 },
    #[error("workflow webhook request failed: {message}")]
    Transport { message: String },
}

#[derive(Debug, Serialize)]
struct TriggerRequest<'a> {
    analysis_id: &'a str,
    oficina: &'a str,
    partida: &'a str,
    area_registral: &'a str,
}

/// Fire-and-forget trigger for the external workflow engine. The engine
/// reports back later through the internal callback endpoint; this client
/// only cares that the hand-off was accepted.
#[derive(Clone)]
pub struct WorkflowClient {
    webhook_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl WorkflowClient {
    pub fn from_config(config: &Config) -> Option<Self> {
        let webhook_url = config.workflow_webhook_url.as_ref()?.trim().to_string();
        let api_key = config.workflow_api_key.as_ref()?.trim().to_string();
        if webhook_url.is_empty() || api_key.is_empty() {
            return None;
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.workflow_timeout_seconds))
            .build()
            .ok()?;

        Some(Self {
            webhook_url,
            api_key,
            http,
        })
    }

    pub async fn trigger(
        &self,
        analysis_id: &str,
        oficina: &str,
        partida: &str,
        area_registral: &str,
    ) -> Result<(), WorkflowError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&TriggerRequest {
                analysis_id,
                oficina,
                partida,
                area_registral,
            })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    WorkflowError::Timeout
                } else {
                    WorkflowError::Transport {
                        message: error.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(
                target: "titulos.workflow",
                analysis_id = %analysis_id,
                status_code = status.as_u16(),
                "workflow_triggered",
            );
            Ok(())
        } else {
            Err(WorkflowError::Status {
                status: status.as_u16(),
            })
        }
    }
}
