//! Remote Sync API over HTTPS with bearer authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::RemoteSyncApi;
use crate::error::{Error, Result};
use crate::protocol::{
    BulkSyncRequest, BulkSyncResponse, ChangesResponse, ConflictBody, PushItem, WriteAccepted,
    WriteOutcome,
};
use crate::util::{is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| Error::InvalidInput("API token must not be empty".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("HTTP client: {error}")))?;
        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(error_from_response(response).await)
        }
    }

    /// Decode a single-record write: `200` accepted, `409` conflict.
    async fn read_write_outcome(response: Response) -> Result<WriteOutcome> {
        if response.status() == StatusCode::CONFLICT {
            let body = response.json::<ConflictBody>().await?;
            return Ok(WriteOutcome::Conflict {
                server_version: body.server_version,
                server_data: body.server_data,
            });
        }
        Ok(WriteOutcome::Accepted(
            Self::read_json::<WriteAccepted>(response).await?,
        ))
    }
}

#[async_trait]
impl RemoteSyncApi for HttpRemoteApi {
    async fn bulk_sync(
        &self,
        entity_type: &str,
        request: &BulkSyncRequest,
    ) -> Result<BulkSyncResponse> {
        let response = self
            .client
            .post(self.url(&format!("{entity_type}/bulk-sync")))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn upsert(&self, entity_type: &str, item: &PushItem) -> Result<WriteOutcome> {
        let response = self
            .client
            .post(self.url(entity_type))
            .bearer_auth(&self.token)
            .json(item)
            .send()
            .await?;
        Self::read_write_outcome(response).await
    }

    async fn delete(
        &self,
        entity_type: &str,
        server_id: &str,
        version: i64,
    ) -> Result<WriteOutcome> {
        let response = self
            .client
            .delete(self.url(&format!("{entity_type}/{server_id}?version={version}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_write_outcome(response).await
    }

    async fn fetch_changes(
        &self,
        entity_type: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Result<ChangesResponse> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(format!("since={since}"));
        }
        if let Some(limit) = limit {
            query.push(format!("limit={limit}"));
        }
        let mut path = format!("{entity_type}s");
        if !query.is_empty() {
            path = format!("{path}?{}", query.join("&"));
        }

        let response = self
            .client
            .get(self.url(&path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn classify_status(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        _ => Error::Server(message),
    }
}

async fn error_from_response(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, parse_api_error(status, &body))
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("API URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "API URL must include http:// or https://".to_string(),
        ))
    }
}
