use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::io::Write;

use crate::common::network::{api_url, default_client, extract_chat_text, read_json, streaming_client};
use crate::config::GatewayConfig;

pub async fn handle_chat(
    cfg: &GatewayConfig,
    model: Option<String>,
    message: String,
    streaming: bool,
    multi_turn: bool,
    all: bool,
) -> Result<()> {
    let model = model.unwrap_or_else(|| cfg.default_model.clone());
    let ce = crate::util::color_enabled_stdout();

    println!("AI Gateway Endpoint: {}", cfg.endpoint);
    println!("API Version: {}", cfg.api_version);

    if all {
        test_simple_chat(cfg, &model, &message).await?;
        test_streaming(cfg, &model, "Write a short poem.").await?;
        test_multi_turn(cfg, &model).await?;
    } else if streaming {
        test_streaming(cfg, &model, &message).await?;
    } else if multi_turn {
        test_multi_turn(cfg, &model).await?;
    } else {
        test_simple_chat(cfg, &model, &message).await?;
    }

    println!("\n{}", crate::util::rule(60));
    println!("{} All tests finished", crate::util::sym_check(ce));
    println!("{}", crate::util::rule(60));
    Ok(())
}

fn completions_url(cfg: &GatewayConfig, model: &str) -> String {
    api_url(
        &cfg.deployments_url(model),
        "/chat/completions",
        &cfg.api_version,
    )
}

async fn complete(cfg: &GatewayConfig, model: &str, messages: &Value, max_tokens: u64) -> Result<Value> {
    let client = default_client(120)?;
    let resp = client
        .post(completions_url(cfg, model))
        .header("api-key", &cfg.api_key)
        .json(&json!({
            "messages": messages,
            "max_tokens": max_tokens,
        }))
        .send()
        .await
        .context("chat completions request")?;
    Ok(read_json(resp).await?)
}

async fn test_simple_chat(cfg: &GatewayConfig, model: &str, message: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Chat Completions test");
    println!("{}", crate::util::rule(60));
    println!("Model: {model}");
    println!("Message: {message}");
    println!("{}", "-".repeat(60));

    let messages = json!([{"role": "user", "content": message}]);
    let body = complete(cfg, model, &messages, 200).await?;

    println!("\n{} Success", crate::util::sym_check(ce));
    println!("Response Model: {}", body.get("model").and_then(|v| v.as_str()).unwrap_or("?"));
    println!("Response ID: {}", body.get("id").and_then(|v| v.as_str()).unwrap_or("?"));
    println!("\nContent:");
    println!("{}", extract_chat_text(&body).unwrap_or_else(|| "(no content)".to_string()));

    if let Some(usage) = body.get("usage") {
        println!("\nUsage:");
        println!("  - Prompt tokens: {}", usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0));
        println!("  - Completion tokens: {}", usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0));
        println!("  - Total tokens: {}", usage.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0));
    }
    Ok(())
}

async fn test_streaming(cfg: &GatewayConfig, model: &str, message: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Streaming test");
    println!("{}", crate::util::rule(60));
    println!("Model: {model}");
    println!("Message: {message}");
    println!("{}", "-".repeat(60));
    println!("\nStreaming response:");

    let client = streaming_client()?;
    let resp = client
        .post(completions_url(cfg, model))
        .header("api-key", &cfg.api_key)
        .header("Accept", "text/event-stream")
        .json(&json!({
            "messages": [{"role": "user", "content": message}],
            "max_tokens": 200,
            "stream": true,
        }))
        .send()
        .await
        .context("streaming chat request")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("streaming chat failed: {status} {body}");
    }

    // SSE frames: one or more `data: <json>` lines separated by a blank
    // line, terminated by `data: [DONE]`.
    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    let mut full_response = String::new();
    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read stream chunk")?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find("\n\n") {
            let frame: String = buf.drain(..pos + 2).collect();
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim_start();
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(delta) = event
                    .get("choices")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|v| v.as_str())
                {
                    print!("{delta}");
                    std::io::stdout().flush().ok();
                    full_response.push_str(delta);
                }
            }
        }
    }

    println!("\n");
    println!(
        "{} Streaming finished (Total chars: {})",
        crate::util::sym_check(ce),
        full_response.len()
    );
    Ok(())
}

async fn test_multi_turn(cfg: &GatewayConfig, model: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("\n{}", crate::util::rule(60));
    println!("Multi-turn conversation test");
    println!("{}", crate::util::rule(60));

    let mut messages = vec![
        json!({"role": "system", "content": "You are a helpful assistant."}),
        json!({"role": "user", "content": "My name is Taro Tanaka. Please remember it."}),
    ];

    println!("\n[Turn 1] User: {}", messages[1]["content"].as_str().unwrap_or(""));
    let body = complete(cfg, model, &Value::Array(messages.clone()), 100).await?;
    let reply1 = extract_chat_text(&body).unwrap_or_else(|| "(no content)".to_string());
    println!("[Turn 1] Assistant: {reply1}");

    messages.push(json!({"role": "assistant", "content": reply1}));
    messages.push(json!({"role": "user", "content": "What was my name?"}));

    println!("\n[Turn 2] User: {}", messages[3]["content"].as_str().unwrap_or(""));
    let body = complete(cfg, model, &Value::Array(messages), 100).await?;
    let reply2 = extract_chat_text(&body).unwrap_or_else(|| "(no content)".to_string());
    println!("[Turn 2] Assistant: {reply2}");

    println!("\n{} Multi-turn conversation finished", crate::util::sym_check(ce));
    Ok(())
}
