// ABOUTME: reqwest-backed transport with bounded exponential retry
// ABOUTME: Unary calls are retried whole; streams retry only until response headers arrive

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::{StreamExt, TryStreamExt};
use reqwest::{multipart, Client, Response};
use serde_json::Value;
use skiff_config::ClientConfig;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::request::{ApiRequest, ApiResponse, Method, RequestBody};
use crate::{ByteStream, Transport};

const USER_AGENT: &str = concat!("skiff/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Transport over HTTPS using a shared connection pool
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
    max_retries: u32,
    retry_initial_interval: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            retry_initial_interval: config.retry_initial_interval,
        })
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial_interval)
            .with_max_interval(MAX_RETRY_INTERVAL)
            .with_max_elapsed_time(None)
            .build()
    }

    fn build(&self, request: &ApiRequest, bounded: bool) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if bounded {
            builder = builder.timeout(request.timeout.unwrap_or(self.request_timeout));
        }

        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { content_type, data } => builder
                .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            RequestBody::Multipart(parts) => {
                let form = parts.iter().fold(multipart::Form::new(), |form, part| {
                    form.part(
                        part.field.clone(),
                        multipart::Part::bytes(part.data.to_vec()).file_name(part.file_name.clone()),
                    )
                });
                builder.multipart(form)
            }
        }
    }

    /// Run `attempt` under the retry policy, giving up after the retry budget
    async fn with_retry<T, F, Fut>(&self, url: &str, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let max_retries = self.max_retries;

        retry(self.policy(), || {
            let fut = attempt();
            let attempts = &attempts;
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_transient() => {
                        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if n > max_retries {
                            return Err(backoff::Error::permanent(err));
                        }
                        warn!(url = %url, attempt = n, error = %err, "Transient failure, retrying");
                        Err(backoff::Error::transient(err))
                    }
                    Err(err) => Err(backoff::Error::permanent(err)),
                }
            }
        })
        .await
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let response = self.build(request, true).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body = response.bytes().await?;
        debug!(url = %request.url, status, bytes = body.len(), "Received response");
        Ok(ApiResponse::new(status, body))
    }

    async fn open_once(&self, request: &ApiRequest) -> Result<Response> {
        let response = self.build(request, false).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }
}

/// Convert a non-success response into a status error carrying the remote message
async fn status_error(response: Response) -> TransportError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.trim().to_string()
            }
        });
    TransportError::status(status.as_u16(), message)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        debug!(method = ?request.method, url = %request.url, "Sending request");
        self.with_retry(&request.url, || self.send_once(&request)).await
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<ByteStream> {
        debug!(method = ?request.method, url = %request.url, "Opening stream");
        let response = self
            .with_retry(&request.url, || self.open_once(&request))
            .await?;
        Ok(response.bytes_stream().map_err(TransportError::from).boxed())
    }
}
