use super::{ActionOutcome, ApiClient};
use crate::backoff::{retry_with_cancellation, BackoffConfig, RetryError, RetryObserver};
use crate::config::HttpConfig;
use crate::plan::ApiCallParams;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Generic HTTP call adapter. Transport errors and 5xx responses are retried
/// with backoff until the caller's token is cancelled; any other response
/// is final.
pub struct ReqwestApiClient {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffConfig,
}

impl ReqwestApiClient {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(config.timeout_ms),
            backoff: config.backoff.clone(),
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        request: &ApiCallParams,
        timeout: Duration,
    ) -> Result<(StatusCode, String), String> {
        let mut builder = self
            .client
            .request(method.clone(), &request.url)
            .timeout(timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| format!("request to {} failed: {}", request.url, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| format!("failed to read response body: {}", err))?;

        if status.is_server_error() {
            return Err(format!("HTTP {}: {}", status.as_u16(), body));
        }
        Ok((status, body))
    }
}

#[async_trait]
impl ApiClient for ReqwestApiClient {
    async fn call(&self, request: &ApiCallParams, cancel: &CancellationToken) -> ActionOutcome {
        let started = Instant::now();
        let method = match Method::from_bytes(request.method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => return ActionOutcome::failed(format!("invalid http method: {}", request.method)),
        };
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        let url = request.url.as_str();
        let observer: RetryObserver<'_, String> = &|attempt, delay, err: &String| {
            log::warn!(
                "api call to {} failed (attempt {}), retrying in {}ms: {}",
                url,
                attempt + 1,
                delay.as_millis(),
                err
            );
        };

        let result = retry_with_cancellation(
            &self.backoff,
            cancel,
            |_| self.send_once(&method, request, timeout),
            Some(observer),
        )
        .await;

        match result {
            Ok((status, body)) if status.is_success() => ActionOutcome::ok(body).timed_from(started),
            Ok((status, body)) => {
                ActionOutcome::failed(format!("HTTP {}: {}", status.as_u16(), body)).timed_from(started)
            }
            Err(RetryError::Exhausted(err)) => ActionOutcome::failed(err).timed_from(started),
            Err(RetryError::Cancelled) => {
                ActionOutcome::failed(format!("api call to {} was cancelled", url)).timed_from(started)
            }
        }
    }
}
