//! HTTP replay of queued actions.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

use super::queue::{ReplayError, Replayer};
use super::store::PendingAction;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Replays queued actions as JSON requests against a base URL.
#[derive(Clone)]
pub struct HttpReplayer {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpReplayer {
  pub fn new(base_url: &str) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid replay base URL '{}': {}", base_url, e))?;
    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: None,
    })
  }

  /// Send `Authorization: Bearer <token>` with every replay.
  pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  fn target(&self, action: &PendingAction) -> Result<(Method, Url), ReplayError> {
    let url = self
      .base_url
      .join(&action.endpoint)
      .map_err(|e| ReplayError::Rejected(format!("invalid endpoint '{}': {}", action.endpoint, e)))?;
    let method = Method::from_bytes(action.method.as_bytes())
      .map_err(|_| ReplayError::Rejected(format!("invalid method '{}'", action.method)))?;
    Ok((method, url))
  }
}

impl Replayer for HttpReplayer {
  fn replay<'a>(&'a self, action: &'a PendingAction) -> BoxFuture<'a, Result<(), ReplayError>> {
    async move {
      let (method, url) = self.target(action)?;
      let mut request = self.client.request(method, url).json(&action.payload);
      if let Some(token) = &self.token {
        request = request.bearer_auth(token);
      }

      let response = request
        .send()
        .await
        .map_err(|e| ReplayError::Retryable(e.to_string()))?;
      classify(response.status())
    }
    .boxed()
  }
}

/// Map an HTTP status to a replay outcome.
///
/// Client errors mean the request itself is wrong and will never succeed,
/// except for timeouts and rate limiting.
pub fn classify(status: StatusCode) -> Result<(), ReplayError> {
  if status.is_success() {
    return Ok(());
  }
  match status {
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
      Err(ReplayError::Retryable(status.to_string()))
    }
    s if s.is_client_error() => Err(ReplayError::Rejected(s.to_string())),
    s => Err(ReplayError::Retryable(s.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  fn action(endpoint: &str, method: &str) -> PendingAction {
    PendingAction {
      id: 1,
      endpoint: endpoint.to_string(),
      method: method.to_string(),
      payload: json!({"id": 1}),
      enqueued_at: Utc::now(),
    }
  }

  #[test]
  fn test_classify_statuses() {
    assert_eq!(classify(StatusCode::OK), Ok(()));
    assert_eq!(classify(StatusCode::NO_CONTENT), Ok(()));
    assert!(matches!(
      classify(StatusCode::UNPROCESSABLE_ENTITY),
      Err(ReplayError::Rejected(_))
    ));
    assert!(matches!(
      classify(StatusCode::NOT_FOUND),
      Err(ReplayError::Rejected(_))
    ));
    assert!(matches!(
      classify(StatusCode::TOO_MANY_REQUESTS),
      Err(ReplayError::Retryable(_))
    ));
    assert!(matches!(
      classify(StatusCode::REQUEST_TIMEOUT),
      Err(ReplayError::Retryable(_))
    ));
    assert!(matches!(
      classify(StatusCode::SERVICE_UNAVAILABLE),
      Err(ReplayError::Retryable(_))
    ));
  }

  #[test]
  fn test_target_joins_endpoint() {
    let replayer = HttpReplayer::new("https://api.example.com").unwrap();
    let (method, url) = replayer.target(&action("/api/trade", "POST")).unwrap();
    assert_eq!(method, Method::POST);
    assert_eq!(url.as_str(), "https://api.example.com/api/trade");
  }

  #[test]
  fn test_bad_method_is_rejected() {
    let replayer = HttpReplayer::new("https://api.example.com").unwrap();
    let err = replayer.target(&action("/api/trade", "PO ST")).unwrap_err();
    assert!(matches!(err, ReplayError::Rejected(_)));
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(HttpReplayer::new("not a url").is_err());
  }

  #[tokio::test]
  async fn test_unreachable_server_is_retryable() {
    // Port 9 on localhost is the discard service and is closed almost everywhere.
    let replayer = HttpReplayer::new("http://127.0.0.1:9").unwrap();
    let err = replayer.replay(&action("/api/trade", "POST")).await.unwrap_err();
    assert!(matches!(err, ReplayError::Retryable(_)));
  }
}
