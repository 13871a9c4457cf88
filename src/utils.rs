use crate::types::{ApiError, ChatMessage, ChatRole, ClientError, Result};
use crate::StreamingCallback;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Check the response status and turn failures into an [`ApiError`].
/// Returns the response unchanged if successful.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;
    let message = error_message(status, &response_text);
    warn!("API error: status={}, message={}", status.as_u16(), message);

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(message),
        StatusCode::UNAUTHORIZED => ApiError::Authentication(message),
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest(message),
        status if status.is_server_error() => ApiError::ServiceError(message),
        _ => ApiError::Unknown(message),
    };
    Err(error.into())
}

/// Human-readable message for a failed request.
///
/// Prefers `error.message` from a JSON error body, then falls back to the
/// status line and whatever text the body carried.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let from_body = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .filter(|m| !m.trim().is_empty());
    if let Some(message) = from_body {
        return message;
    }

    let status_line = format!(
        "Request failed with status {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let status_line = status_line.trim_end().to_string();
    let body = body.trim();
    if body.is_empty() {
        status_line
    } else {
        format!("{status_line}: {body}")
    }
}

/// Reply shown instead of an error when the provider rate limits us
pub fn rate_limit_fallback_text(messages: &[ChatMessage]) -> String {
    let user_message = messages
        .iter()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    format!(
        "I received your message: \"{user_message}\". However, we're currently being rate \
         limited by the API. Please try again in a few minutes."
    )
}

/// Deliver `text` word by word so the caller sees the same incremental
/// updates a real stream would produce.
///
/// Returns false if the token was cancelled before every word was delivered.
pub async fn replay_words(
    text: &str,
    delay: Duration,
    callback: &StreamingCallback,
    cancel: &CancellationToken,
) -> Result<bool> {
    for word in text.split(' ') {
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        } else if cancel.is_cancelled() {
            return Ok(false);
        }
        callback(&format!("{word} ")).map_err(ClientError::Callback)?;
    }
    Ok(true)
}
