use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

use crate::common::network::{api_url, default_client, read_json};
use crate::config::GatewayConfig;
use crate::wait::{wait, Operation, PollPolicy};

/// Statuses after which a run stops changing.
const RUN_TERMINAL: [&str; 4] = ["completed", "failed", "cancelled", "expired"];

const RUN_TIMEOUT: Duration = Duration::from_secs(60);
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn handle_assistants(
    cfg: &GatewayConfig,
    model: Option<String>,
    list: bool,
    no_cleanup: bool,
) -> Result<()> {
    let model = model.unwrap_or_else(|| cfg.default_model.clone());

    println!("AI Gateway Endpoint: {}", cfg.endpoint);
    println!("API Version: {}", cfg.api_version);
    println!("Model: {model}");

    let client = AssistantsClient::new(cfg)?;
    if list {
        list_assistants(&client).await
    } else {
        test_full_workflow(&client, &model, !no_cleanup).await
    }
}

pub struct AssistantsClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_version: String,
}

impl AssistantsClient {
    pub fn new(cfg: &GatewayConfig) -> Result<Self> {
        Self::with_base(cfg.base_url_openai(), cfg.api_key.clone(), cfg.api_version.clone())
    }

    fn with_base(base_url: String, api_key: String, api_version: String) -> Result<Self> {
        Ok(Self { http: default_client(60)?, base_url, api_key, api_version })
    }

    fn url(&self, path: &str) -> String {
        api_url(&self.base_url, path, &self.api_version)
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(path))
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        Ok(read_json(resp).await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(path))
            .header("api-key", &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        Ok(read_json(resp).await?)
    }

    pub async fn create_assistant(&self, name: &str, model: &str, instructions: &str) -> Result<Value> {
        self.post_json(
            "/assistants",
            json!({ "name": name, "model": model, "instructions": instructions }),
        )
        .await
    }

    pub async fn delete_assistant(&self, assistant_id: &str) -> Result<Value> {
        let resp = self
            .http
            .delete(self.url(&format!("/assistants/{assistant_id}")))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("delete assistant")?;
        Ok(read_json(resp).await?)
    }

    pub async fn list_assistants(&self) -> Result<Value> {
        self.get_json("/assistants").await
    }

    pub async fn create_thread(&self) -> Result<Value> {
        self.post_json("/threads", json!({})).await
    }

    pub async fn add_message(&self, thread_id: &str, content: &str) -> Result<Value> {
        self.post_json(
            &format!("/threads/{thread_id}/messages"),
            json!({ "role": "user", "content": content }),
        )
        .await
    }

    pub async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Value> {
        self.post_json(
            &format!("/threads/{thread_id}/runs"),
            json!({ "assistant_id": assistant_id }),
        )
        .await
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Value> {
        self.get_json(&format!("/threads/{thread_id}/runs/{run_id}")).await
    }

    pub async fn get_messages(&self, thread_id: &str) -> Result<Value> {
        self.get_json(&format!("/threads/{thread_id}/messages")).await
    }

    /// Poll the run through the waiter until it reaches a terminal status.
    pub async fn wait_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
        policy: &PollPolicy,
    ) -> Result<Operation> {
        let op = wait(
            run_id,
            |id| async move { Ok(Operation::from_body(self.get_run(thread_id, &id).await?)) },
            policy,
        )
        .await?;
        Ok(op)
    }
}

async fn test_full_workflow(client: &AssistantsClient, model: &str, cleanup: bool) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Assistants API workflow test");
    println!("{}", crate::util::rule(60));

    println!("\n1. Creating Assistant...");
    let assistant = client
        .create_assistant(
            "test-assistant",
            model,
            "You are a helpful assistant. Answer concisely.",
        )
        .await?;
    let assistant_id = assistant
        .get("id")
        .and_then(|v| v.as_str())
        .context("assistant response had no id")?
        .to_string();
    println!("   {} Assistant ID: {assistant_id}", crate::util::sym_check(ce));

    let outcome = run_thread_flow(client, &assistant_id).await;

    if cleanup {
        println!("\n7. Cleanup...");
        match client.delete_assistant(&assistant_id).await {
            Ok(_) => println!("   {} Assistant {assistant_id} deleted", crate::util::sym_check(ce)),
            Err(e) => println!("   {} Cleanup failed: {e:#}", crate::util::sym_question(ce)),
        }
    }

    outcome
}

async fn run_thread_flow(client: &AssistantsClient, assistant_id: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n2. Creating Thread...");
    let thread = client.create_thread().await?;
    let thread_id = thread
        .get("id")
        .and_then(|v| v.as_str())
        .context("thread response had no id")?
        .to_string();
    println!("   {} Thread ID: {thread_id}", crate::util::sym_check(ce));

    println!("\n3. Adding Message...");
    let user_message = "What are the top three features of Azure AI Foundry?";
    let message = client.add_message(&thread_id, user_message).await?;
    println!(
        "   {} Message ID: {}",
        crate::util::sym_check(ce),
        message.get("id").and_then(|v| v.as_str()).unwrap_or("?")
    );
    println!("   User: {user_message}");

    println!("\n4. Creating Run...");
    let run = client.create_run(&thread_id, assistant_id).await?;
    let run_id = run
        .get("id")
        .and_then(|v| v.as_str())
        .context("run response had no id")?
        .to_string();
    println!("   {} Run ID: {run_id}", crate::util::sym_check(ce));
    println!(
        "   Initial Status: {}",
        run.get("status").and_then(|v| v.as_str()).unwrap_or("unknown")
    );

    println!("\n5. Waiting for Run to complete...");
    let policy = PollPolicy::new(RUN_TIMEOUT, RUN_POLL_INTERVAL, RUN_TERMINAL)?;
    let completed_run = client.wait_for_run(&thread_id, &run_id, &policy).await?;
    println!("   {} Final Status: {}", crate::util::sym_check(ce), completed_run.status);

    // Terminal-but-unsuccessful runs are reported, not raised.
    if completed_run.status != "completed" {
        println!(
            "   {} Run finished with status: {}",
            crate::util::sym_cross(ce),
            completed_run.status
        );
        return Ok(());
    }

    println!("\n6. Retrieving Messages...");
    let messages = client.get_messages(&thread_id).await?;

    println!("\n{}", crate::util::rule(60));
    println!("Conversation:");
    println!("{}", "-".repeat(60));

    let mut sorted: Vec<Value> = messages
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    sorted.sort_by_key(|m| m.get("created_at").and_then(|v| v.as_i64()).unwrap_or(0));

    for msg in &sorted {
        let role = msg
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_uppercase();
        let content = message_text(msg).unwrap_or_else(|| "(empty)".to_string());
        println!("\n[{role}]");
        println!("{content}");
    }

    println!("\n{}", crate::util::rule(60));
    println!("{} Workflow test finished", crate::util::sym_check(ce));
    println!("{}", crate::util::rule(60));
    Ok(())
}

/// First text block of an Assistants message.
fn message_text(msg: &Value) -> Option<String> {
    msg.get("content")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("text"))
        .and_then(|t| t.get("value"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

async fn list_assistants(client: &AssistantsClient) -> Result<()> {
    println!("\n{}", crate::util::rule(60));
    println!("Assistants");
    println!("{}", crate::util::rule(60));

    let assistants = client.list_assistants().await?;
    let data = assistants
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if data.is_empty() {
        println!("(No assistants found)");
        return Ok(());
    }

    for asst in &data {
        println!("\n  ID: {}", asst.get("id").and_then(|v| v.as_str()).unwrap_or("?"));
        println!(
            "  Name: {}",
            asst.get("name").and_then(|v| v.as_str()).unwrap_or("(unnamed)")
        );
        println!("  Model: {}", asst.get("model").and_then(|v| v.as_str()).unwrap_or("?"));
        println!("  Created: {}", format_created_at(asst.get("created_at")));
    }
    Ok(())
}

fn format_created_at(value: Option<&Value>) -> String {
    value
        .and_then(|v| v.as_i64())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::network::ApiError;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AssistantsClient {
        AssistantsClient::with_base(
            server.uri(),
            "test-key".to_string(),
            "2025-03-01-preview".to_string(),
        )
        .unwrap()
    }

    fn test_policy() -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(5),
            Duration::from_millis(10),
            RUN_TERMINAL,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn requests_carry_api_key_and_api_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assistants"))
            .and(header("api-key", "test-key"))
            .and(query_param("api-version", "2025-03-01-preview"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "asst_1", "name": "test-assistant", "model": "gpt-4o"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let assistant = client
            .create_assistant("test-assistant", "gpt-4o", "instructions")
            .await
            .unwrap();
        assert_eq!(assistant["id"], "asst_1");
    }

    #[tokio::test]
    async fn wait_for_run_returns_the_terminal_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/runs/run_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "run_1", "status": "completed"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let run = client
            .wait_for_run("thread_1", "run_1", &test_policy())
            .await
            .unwrap();
        assert_eq!(run.id, "run_1");
        assert_eq!(run.status, "completed");
    }

    #[tokio::test]
    async fn missing_run_surfaces_as_not_found() {
        let server = MockServer::start().await;

        let client = client_for(&server);
        let err = client.get_run("thread_1", "run_gone").await.unwrap_err();
        let api_err = err.downcast_ref::<ApiError>().expect("ApiError in chain");
        assert!(matches!(api_err, ApiError::NotFound { .. }));
    }

    #[test]
    fn message_text_reads_first_text_block() {
        let msg = serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": {"value": "hello"}}]
        });
        assert_eq!(message_text(&msg).as_deref(), Some("hello"));
        assert_eq!(message_text(&serde_json::json!({"content": []})), None);
    }

    #[test]
    fn created_at_renders_as_utc() {
        let v = serde_json::json!(1700000000);
        assert_eq!(format_created_at(Some(&v)), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_created_at(None), "?");
    }
}
