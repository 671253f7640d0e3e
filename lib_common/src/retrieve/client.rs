//! # Generic HTTP API Client with Retry Middleware
//!
//! This module provides a small HTTP client (`ApiClient`) for making JSON
//! requests to external APIs. It leverages `reqwest_middleware` to
//! automatically handle transient network errors with an exponential backoff
//! retry policy, making API interactions more resilient.

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Custom error types for API operations.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid base URL '{0}'")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    RequestError(String),
    #[error("Unexpected HTTP status {status}: {body}")]
    StatusError { status: u16, body: String },
    #[error("Failed to decode response body: {0}")]
    DecodeError(String),
}

/// A client for making HTTP requests against a fixed base URL.
/// Transient failures are retried with exponential backoff.
pub struct ApiClient {
    /// The underlying `reqwest_middleware` client, configured with retry policies.
    inner: ClientWithMiddleware,
    /// The base URL all request paths are joined against.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance.
    ///
    /// # Arguments
    /// * `base_url` - The base URL for all API requests (e.g., "http://localhost:1888/").
    /// * `timeout` - Per-request timeout applied to every attempt.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let url = Url::parse(base_url).map_err(|_| ApiError::InvalidUrl(base_url.to_string()))?;

        // Up to 3 retries with exponential backoff for transient errors.
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::RequestError(e.to_string()))?;

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
        })
    }

    /// Issues a GET request for `path` and deserializes the JSON response
    /// body into `T`. Non-2xx statuses are returned as `StatusError` with
    /// the raw body preserved for logging.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|_| ApiError::InvalidUrl(path.to_string()))?;

        let response = self
            .inner
            .get(full_url)
            .send()
            .await
            .map_err(|e| ApiError::RequestError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::StatusError {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_base_url() {
        let result = ApiClient::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }
}
