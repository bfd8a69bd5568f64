use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde_json::{json, Value};

use crate::common::network::{api_url, default_client, extract_output_text, read_json};
use crate::config::GatewayConfig;
use crate::wait::{wait, Operation, PollPolicy};

/// Statuses after which a response stops changing.
const RESPONSE_TERMINAL: [&str; 4] = ["completed", "failed", "cancelled", "expired"];

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub async fn handle_responses(
    cfg: &GatewayConfig,
    model: Option<String>,
    message: String,
    multi_turn: bool,
    background: bool,
    cancel: Option<String>,
    all: bool,
    timeout: u64,
) -> Result<()> {
    let model = model.unwrap_or_else(|| cfg.default_model.clone());
    let ce = crate::util::color_enabled_stdout();

    println!("AI Gateway Endpoint: {}", cfg.endpoint);
    println!("Model: {model}");
    println!("API Version: {}", cfg.api_version);

    let client = ResponsesClient::new(cfg)?;

    if let Some(response_id) = cancel {
        return cancel_background(&client, &response_id).await;
    }

    if all {
        test_simple_response(&client, &model, &message).await?;
        test_multi_turn(&client, &model).await?;
        test_background_task(&client, &model, timeout).await?;
    } else if multi_turn {
        test_multi_turn(&client, &model).await?;
    } else if background {
        test_background_task(&client, &model, timeout).await?;
    } else {
        test_simple_response(&client, &model, &message).await?;
    }

    println!("\n{}", crate::util::rule(60));
    println!("{} All tests finished", crate::util::sym_check(ce));
    println!("{}", crate::util::rule(60));
    Ok(())
}

pub struct ResponsesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_version: String,
}

#[derive(Debug, Default)]
pub struct CreateResponse<'a> {
    pub previous_response_id: Option<&'a str>,
    pub background: bool,
    pub store: Option<bool>,
}

impl ResponsesClient {
    pub fn new(cfg: &GatewayConfig) -> Result<Self> {
        Self::with_base(cfg.base_url_openai(), cfg.api_key.clone(), cfg.api_version.clone())
    }

    fn with_base(base_url: String, api_key: String, api_version: String) -> Result<Self> {
        Ok(Self { http: default_client(120)?, base_url, api_key, api_version })
    }

    fn url(&self, path: &str) -> String {
        api_url(&self.base_url, path, &self.api_version)
    }

    pub async fn create_response(
        &self,
        model: &str,
        input_text: &str,
        opts: CreateResponse<'_>,
    ) -> Result<Value> {
        let mut body = json!({ "model": model, "input": input_text });
        if let Some(prev) = opts.previous_response_id {
            body["previous_response_id"] = json!(prev);
        }
        if opts.background {
            body["background"] = json!(true);
            // background requires store=true
            body["store"] = json!(true);
        } else if let Some(store) = opts.store {
            body["store"] = json!(store);
        }

        let resp = self
            .http
            .post(self.url("/responses"))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("create response request")?;
        Ok(read_json(resp).await?)
    }

    pub async fn get_response(&self, response_id: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/responses/{response_id}")))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("get response request")?;
        Ok(read_json(resp).await?)
    }

    pub async fn cancel_response(&self, response_id: &str) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(&format!("/responses/{response_id}/cancel")))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("cancel response request")?;
        Ok(read_json(resp).await?)
    }

    /// Poll a background response through the waiter until terminal,
    /// reporting the in-flight status via `on_status`.
    pub async fn wait_for_response<F>(
        &self,
        response_id: &str,
        policy: &PollPolicy,
        on_status: F,
    ) -> Result<Operation>
    where
        F: FnMut(&str),
    {
        // Polls run strictly one at a time, so the callback is never
        // borrowed twice; the RefCell only satisfies the FnMut closure.
        let on_status = std::cell::RefCell::new(on_status);
        let on_status = &on_status;
        let op = wait(
            response_id,
            |id| async move {
                let op = Operation::from_body(self.get_response(&id).await?);
                (on_status.borrow_mut())(&op.status);
                Ok(op)
            },
            policy,
        )
        .await?;
        Ok(op)
    }
}

async fn test_simple_response(client: &ResponsesClient, model: &str, message: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Responses API - basic test");
    println!("{}", crate::util::rule(60));
    println!("Model: {model}");
    println!("Input: {message}");
    println!("{}", "-".repeat(60));

    let response = client
        .create_response(model, message, CreateResponse::default())
        .await?;

    println!("\n{} Success", crate::util::sym_check(ce));
    println!("Response ID: {}", response.get("id").and_then(|v| v.as_str()).unwrap_or("?"));
    println!("Model: {}", response.get("model").and_then(|v| v.as_str()).unwrap_or("?"));
    println!("Status: {}", response.get("status").and_then(|v| v.as_str()).unwrap_or("?"));

    println!("\nOutput:");
    println!("{}", extract_output_text(&response).unwrap_or_else(|| "(no text output)".to_string()));

    print_usage(&response);
    Ok(())
}

async fn test_multi_turn(client: &ResponsesClient, model: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Responses API - multi-turn conversation test");
    println!("{}", crate::util::rule(60));

    println!("\n[Turn 1]");
    println!("User: My name is Taro Tanaka. Please remember it.");
    let response1 = client
        .create_response(
            model,
            "My name is Taro Tanaka. Please remember it.",
            CreateResponse::default(),
        )
        .await?;
    println!(
        "Assistant: {}",
        extract_output_text(&response1).unwrap_or_else(|| "(no text output)".to_string())
    );
    let response1_id = response1
        .get("id")
        .and_then(|v| v.as_str())
        .context("first response had no id")?;
    println!("(Response ID: {response1_id})");

    println!("\n[Turn 2]");
    println!("User: What was my name?");
    let response2 = client
        .create_response(
            model,
            "What was my name?",
            CreateResponse { previous_response_id: Some(response1_id), ..Default::default() },
        )
        .await?;
    println!(
        "Assistant: {}",
        extract_output_text(&response2).unwrap_or_else(|| "(no text output)".to_string())
    );

    println!("\n{}", crate::util::rule(60));
    println!("{} Multi-turn conversation test finished", crate::util::sym_check(ce));
    println!("{}", crate::util::rule(60));
    Ok(())
}

async fn test_background_task(client: &ResponsesClient, model: &str, timeout: u64) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Responses API - background task test");
    println!("{}", crate::util::rule(60));

    println!("\nStarting background task...");
    let response = client
        .create_response(
            model,
            "Write a short explanation of artificial intelligence.",
            CreateResponse { background: true, ..Default::default() },
        )
        .await?;

    let response_id = response
        .get("id")
        .and_then(|v| v.as_str())
        .context("background response had no id")?
        .to_string();
    let initial = Operation::from_body(response);

    println!("Response ID: {response_id}");
    println!("Initial Status: {}", initial.status);

    let policy = PollPolicy::new(
        Duration::from_secs(timeout),
        RESPONSE_POLL_INTERVAL,
        RESPONSE_TERMINAL,
    )?;

    // The create call may come back already terminal; no poll needed then.
    if policy.is_terminal(&initial.status) {
        println!("\nTask already finished with status: {}", initial.status);
    } else {
        println!("\nPolling for completion...");
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        let completed = client
            .wait_for_response(&response_id, &policy, |status| {
                pb.set_message(format!("status: {status}..."));
            })
            .await;
        pb.finish_and_clear();
        let completed = completed?;

        println!("\n{} Final Status: {}", crate::util::sym_check(ce), completed.status);
        if completed.status == "completed" {
            println!("\nOutput:");
            println!(
                "{}",
                extract_output_text(&completed.body)
                    .unwrap_or_else(|| "(no text output)".to_string())
            );
        }
    }

    println!("\n{}", crate::util::rule(60));
    println!("{} Background task test finished", crate::util::sym_check(ce));
    println!("{}", crate::util::rule(60));
    Ok(())
}

async fn cancel_background(client: &ResponsesClient, response_id: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();
    let body = client.cancel_response(response_id).await?;
    println!(
        "{} Cancelled {response_id} (status: {})",
        crate::util::sym_check(ce),
        body.get("status").and_then(|v| v.as_str()).unwrap_or("?")
    );
    Ok(())
}

fn print_usage(response: &Value) {
    let Some(usage) = response.get("usage").filter(|u| !u.is_null()) else { return };
    println!("\nUsage:");
    for (label, key) in [
        ("Input tokens", "input_tokens"),
        ("Output tokens", "output_tokens"),
        ("Total tokens", "total_tokens"),
    ] {
        match usage.get(key).and_then(|v| v.as_u64()) {
            Some(n) => println!("  - {label}: {n}"),
            None => println!("  - {label}: N/A"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ResponsesClient {
        ResponsesClient::with_base(
            server.uri(),
            "test-key".to_string(),
            "2025-03-01-preview".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn background_create_forces_store() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "background": true,
                "store": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1", "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body = client
            .create_response(
                "gpt-4o",
                "hello",
                CreateResponse { background: true, store: Some(false), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(body["id"], "resp_1");
    }

    #[tokio::test]
    async fn multi_turn_passes_previous_response_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(body_partial_json(json!({ "previous_response_id": "resp_1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_2", "status": "completed"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body = client
            .create_response(
                "gpt-4o",
                "and then?",
                CreateResponse { previous_response_id: Some("resp_1"), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(body["id"], "resp_2");
    }

    #[tokio::test]
    async fn wait_for_response_reports_status_and_returns_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/responses/resp_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "status": "completed",
                "output": [{"type": "message", "content": [
                    {"type": "output_text", "text": "done"}
                ]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let policy = PollPolicy::new(
            Duration::from_secs(5),
            Duration::from_millis(10),
            RESPONSE_TERMINAL,
        )
        .unwrap();

        let mut seen = Vec::new();
        let op = client
            .wait_for_response("resp_1", &policy, |status| seen.push(status.to_string()))
            .await
            .unwrap();
        assert_eq!(op.status, "completed");
        assert_eq!(seen, vec!["completed".to_string()]);
        assert_eq!(extract_output_text(&op.body).as_deref(), Some("done"));
    }
}
