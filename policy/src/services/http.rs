//! reqwest implementations of the collaborator traits

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{
    AnalysisRequest, ExpertMatcher, ExpertNotification, ExpertNotifier, ExpertQuery,
    RecitationAnalyzer, ServiceError, ServiceResult,
};
use crate::config::{AnalysisConfig, ExpertConfig};
use crate::escalation::{AnalysisResult, Expert};

pub(crate) fn build_client(timeout: Duration) -> ServiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::Request(format!("failed to create HTTP client: {}", e)))
}

fn require_endpoint(name: &str, endpoint: String) -> ServiceResult<String> {
    if endpoint.trim().is_empty() {
        Err(ServiceError::NotConfigured(format!("{} endpoint is empty", name)))
    } else {
        Ok(endpoint)
    }
}

/// POST a JSON body and fail on non-2xx
pub(crate) async fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> ServiceResult<reqwest::Response> {
    let response = client.post(url).json(body).send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::Status { status, body });
    }
    Ok(response)
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> ServiceResult<R> {
    response
        .json()
        .await
        .map_err(|e| ServiceError::Decode(e.to_string()))
}

/// Expert matching over HTTP (`POST {userRegion, preferredLanguage, ...}`)
pub struct HttpExpertMatcher {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpExpertMatcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ServiceResult<Self> {
        Ok(Self {
            endpoint: require_endpoint("expert matching", endpoint.into())?,
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &ExpertConfig) -> ServiceResult<Self> {
        Self::new(config.matching_url.clone(), config.http_timeout())
    }
}

#[async_trait]
impl ExpertMatcher for HttpExpertMatcher {
    async fn find_experts(&self, query: &ExpertQuery) -> ServiceResult<Vec<Expert>> {
        let response = post_json(&self.client, &self.endpoint, query).await?;
        let experts: Vec<Expert> = decode(response).await?;
        debug!(count = experts.len(), urgency = %query.urgency, "experts matched");
        Ok(experts)
    }
}

/// Expert notification over HTTP
pub struct HttpExpertNotifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpExpertNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ServiceResult<Self> {
        Ok(Self {
            endpoint: require_endpoint("expert notification", endpoint.into())?,
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &ExpertConfig) -> ServiceResult<Self> {
        Self::new(config.notify_url.clone(), config.http_timeout())
    }
}

#[async_trait]
impl ExpertNotifier for HttpExpertNotifier {
    async fn notify(&self, notification: &ExpertNotification) -> ServiceResult<()> {
        post_json(&self.client, &self.endpoint, notification).await?;
        debug!(
            expert_id = %notification.expert_id,
            request_id = %notification.correction_request_id,
            "expert notified"
        );
        Ok(())
    }
}

/// AI recitation analysis over HTTP
pub struct HttpRecitationAnalyzer {
    endpoint: String,
    model_version: String,
    client: reqwest::Client,
}

impl HttpRecitationAnalyzer {
    pub fn new(
        endpoint: impl Into<String>,
        model_version: impl Into<String>,
        timeout: Duration,
    ) -> ServiceResult<Self> {
        Ok(Self {
            endpoint: require_endpoint("analysis", endpoint.into())?,
            model_version: model_version.into(),
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> ServiceResult<Self> {
        Self::new(
            config.endpoint.clone(),
            config.model_version.clone(),
            config.http_timeout(),
        )
    }

    /// Request for `audio_data` using the configured analysis type and target
    pub fn request_for(config: &AnalysisConfig, audio_data: impl Into<String>) -> AnalysisRequest {
        AnalysisRequest {
            audio_data: audio_data.into(),
            analysis_type: config.analysis_type.clone(),
            accuracy: config.display_accuracy,
        }
    }
}

#[async_trait]
impl RecitationAnalyzer for HttpRecitationAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> ServiceResult<AnalysisResult> {
        let response = post_json(&self.client, &self.endpoint, request).await?;
        let result: AnalysisResult = decode(response).await?;
        if !(0.0..=100.0).contains(&result.accuracy) {
            return Err(ServiceError::Decode(format!(
                "accuracy {} outside [0, 100]",
                result.accuracy
            )));
        }
        debug!(
            accuracy = result.accuracy,
            model_version = %self.model_version,
            "recitation analyzed"
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP responder for client tests

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve a single request with `status` and `body`; the handle yields
    /// the raw request body that was received.
    pub async fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if let Some(split) = find(&raw, b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&raw[..split]).to_lowercase();
                    let length = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            let split = find(&raw, b"\r\n\r\n").map(|i| i + 4).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[split..]).to_string()
        });

        (url, handle)
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }
}
