use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;

/// Transport outcomes the commands care to tell apart. Anything the remote
/// side reports as a non-success status lands here; timeouts while polling
/// are the waiter's business, not the transport's.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("upstream returned {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
}

pub fn default_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .context("create http client")
}

/// Client without a request timeout. Streaming responses can be long lived.
pub fn streaming_client() -> Result<Client> {
    Client::builder().build().context("create http client")
}

/// `{base}{path}?api-version={v}` — every gateway call carries the
/// api-version as a query parameter.
pub fn api_url(base: &str, path: &str, api_version: &str) -> String {
    format!("{base}{path}?api-version={api_version}")
}

/// Map the status line into `ApiError`, handing back the response untouched
/// on success. Callers that expect no body use this directly.
pub async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound { url: resp.url().to_string() });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Upstream { status, body });
    }
    Ok(resp)
}

/// Decode a JSON body after mapping the status line into `ApiError`.
pub async fn read_json(resp: Response) -> Result<Value, ApiError> {
    Ok(ensure_success(resp).await?.json().await?)
}

/// Pull the assistant text out of a Responses API body: every
/// `output_text` part of every `message` output item, concatenated.
pub fn extract_output_text(body: &Value) -> Option<String> {
    let mut texts = Vec::new();
    for output in body.get("output").and_then(|v| v.as_array())? {
        if output.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        if let Some(parts) = output.get("content").and_then(|v| v.as_array()) {
            for part in parts {
                if part.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        texts.push(text.to_string());
                    }
                }
            }
        }
    }
    if texts.is_empty() { None } else { Some(texts.join("\n")) }
}

/// Pull the assistant text out of a Chat Completions body.
pub fn extract_chat_text(body: &Value) -> Option<String> {
    body.get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
