use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde_json::{json, Value};

use crate::common::network::{api_url, default_client, ensure_success, read_json};
use crate::config::{load_agent_manifest, AgentManifest};
use crate::wait::{wait, Operation, PollPolicy};

/// Management-plane API version for the Foundry project endpoint.
const MGMT_API_VERSION: &str = "v1";

/// Provisioning states after which a deployment stops changing. ARM reports
/// these in PascalCase; the policy compares case-insensitively.
const DEPLOY_TERMINAL: [&str; 3] = ["succeeded", "failed", "canceled"];

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register (or update) an image-based hosted agent
    Create {
        /// AI Foundry Project endpoint
        #[arg(long)]
        endpoint: String,
        /// Container image (e.g. acr.azurecr.io/agent:v1)
        #[arg(long)]
        image: Option<String>,
        /// Agent name
        #[arg(long)]
        name: Option<String>,
        /// CPU (default: 1)
        #[arg(long)]
        cpu: Option<String>,
        /// Memory (default: 2Gi)
        #[arg(long)]
        memory: Option<String>,
        /// Model deployment the agent container should call
        #[arg(long)]
        model: Option<String>,
        /// YAML manifest with the fields above; flags override it
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Poll the created version until provisioning finishes
        #[arg(long)]
        wait: bool,
        /// Seconds to wait for provisioning with --wait
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// List registered agents
    List {
        /// AI Foundry Project endpoint
        #[arg(long)]
        endpoint: String,
    },
    /// Delete an agent
    Delete {
        /// AI Foundry Project endpoint
        #[arg(long)]
        endpoint: String,
        /// Agent name
        #[arg(long)]
        name: String,
    },
    /// Show an agent's current status
    Status {
        /// AI Foundry Project endpoint
        #[arg(long)]
        endpoint: String,
        /// Agent name
        #[arg(long)]
        name: String,
        /// Poll until the agent reaches a terminal provisioning state
        #[arg(long)]
        wait: bool,
        /// Seconds to wait with --wait
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Seconds between polls with --wait
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
    },
}

pub async fn handle(command: AgentCommands) -> Result<()> {
    match command {
        AgentCommands::Create {
            endpoint,
            image,
            name,
            cpu,
            memory,
            model,
            manifest,
            wait,
            timeout,
        } => {
            let manifest = match manifest {
                Some(path) => load_agent_manifest(&path)?,
                None => AgentManifest::default(),
            };
            let spec = AgentSpec::resolve(manifest, image, name, cpu, memory, model)?;
            let client = AgentsClient::connect(endpoint).await?;
            handle_create(&client, spec, wait, timeout).await
        }
        AgentCommands::List { endpoint } => {
            let client = AgentsClient::connect(endpoint).await?;
            handle_list(&client).await
        }
        AgentCommands::Delete { endpoint, name } => {
            let client = AgentsClient::connect(endpoint).await?;
            handle_delete(&client, &name).await
        }
        AgentCommands::Status { endpoint, name, wait, timeout, poll_interval } => {
            let client = AgentsClient::connect(endpoint).await?;
            handle_status(&client, &name, wait, timeout, poll_interval).await
        }
    }
}

/// Fully-resolved deployment description: manifest fields overridden by
/// flags, then script defaults.
#[derive(Debug)]
struct AgentSpec {
    name: String,
    image: String,
    cpu: String,
    memory: String,
    model: String,
    extra_env: BTreeMap<String, String>,
}

impl AgentSpec {
    fn resolve(
        manifest: AgentManifest,
        image: Option<String>,
        name: Option<String>,
        cpu: Option<String>,
        memory: Option<String>,
        model: Option<String>,
    ) -> Result<Self> {
        let image = image
            .or(manifest.image)
            .context("no container image given; pass --image or put one in the manifest")?;
        Ok(Self {
            name: name.or(manifest.name).unwrap_or_else(|| "demo-hosted-agent".to_string()),
            image,
            cpu: cpu.or(manifest.cpu).unwrap_or_else(|| "1".to_string()),
            memory: memory.or(manifest.memory).unwrap_or_else(|| "2Gi".to_string()),
            model: model.or(manifest.model).unwrap_or_else(|| "gpt-4o-mini".to_string()),
            extra_env: manifest.environment_variables,
        })
    }
}

struct AgentsClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl AgentsClient {
    async fn connect(endpoint: String) -> Result<Self> {
        let token = acquire_token().await?;
        Ok(Self {
            http: default_client(60)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        api_url(&self.endpoint, path, MGMT_API_VERSION)
    }

    async fn create_version(&self, name: &str, definition: Value) -> Result<Value> {
        let resp = self
            .http
            .post(self.url(&format!("/agents/{name}/versions")))
            .bearer_auth(&self.token)
            .json(&json!({ "definition": definition }))
            .send()
            .await
            .context("create agent version request")?;
        Ok(read_json(resp).await?)
    }

    async fn list_agents(&self) -> Result<Value> {
        let resp = self
            .http
            .get(self.url("/agents"))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("list agents request")?;
        Ok(read_json(resp).await?)
    }

    async fn get_agent(&self, name: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/agents/{name}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("get agent request")?;
        Ok(read_json(resp).await?)
    }

    async fn get_version(&self, name: &str, version: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/agents/{name}/versions/{version}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("get agent version request")?;
        Ok(read_json(resp).await?)
    }

    async fn delete_agent(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/agents/{name}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("delete agent request")?;
        ensure_success(resp).await?;
        Ok(())
    }
}

async fn handle_create(client: &AgentsClient, spec: AgentSpec, wait_flag: bool, timeout: u64) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    println!("Creating hosted agent: {}", spec.name);
    println!("  Endpoint: {}", client.endpoint);
    println!("  Image: {}", spec.image);
    println!("  CPU: {}, Memory: {}", spec.cpu, spec.memory);
    println!();

    let definition = build_definition(&client.endpoint, &spec);
    let agent = client.create_version(&spec.name, definition).await?;

    // Versions come back as strings from the SDK surface and numbers from
    // the raw REST one.
    let version = match agent.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "1".to_string(),
    };
    println!("{} Agent created successfully", crate::util::sym_check(ce));
    println!("  Name: {}", agent.get("name").and_then(|v| v.as_str()).unwrap_or(&spec.name));
    println!("  Version: {version}");

    if wait_flag {
        println!();
        let final_op = wait_for_deployment(client, &spec.name, &version, timeout, 5).await?;
        println!(
            "{} Provisioning finished: {}",
            if final_op.status.eq_ignore_ascii_case("succeeded") {
                crate::util::sym_check(ce)
            } else {
                crate::util::sym_cross(ce)
            },
            final_op.status
        );
    }

    println!();
    println!("Next steps:");
    println!("  1. Open the project in the Azure AI Foundry Portal");
    println!("  2. Agents -> {}", spec.name);
    println!("  3. 'Start' to launch the agent");
    println!("  4. Test it in the Playground");
    Ok(())
}

async fn handle_list(client: &AgentsClient) -> Result<()> {
    let body = client.list_agents().await?;
    let agents = agent_entries(&body);
    println!("Found {} agent(s):", agents.len());
    for agent in agents {
        println!(
            "  - {} (id: {})",
            agent.get("name").and_then(|v| v.as_str()).unwrap_or("(unnamed)"),
            agent.get("id").and_then(|v| v.as_str()).unwrap_or("?")
        );
    }
    Ok(())
}

async fn handle_delete(client: &AgentsClient, name: &str) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();
    client.delete_agent(name).await?;
    println!("{} Agent '{}' deleted", crate::util::sym_check(ce), name);
    Ok(())
}

async fn handle_status(
    client: &AgentsClient,
    name: &str,
    wait_flag: bool,
    timeout: u64,
    poll_interval: u64,
) -> Result<()> {
    let body = client.get_agent(name).await?;
    let op = Operation::from_body(body);
    println!("Agent: {name}");
    println!("  Id: {}", if op.id.is_empty() { "?" } else { &op.id });
    println!("  Status: {}", op.status);

    if !wait_flag {
        return Ok(());
    }

    let policy = PollPolicy::new(
        Duration::from_secs(timeout),
        Duration::from_secs(poll_interval),
        DEPLOY_TERMINAL,
    )?;
    let pb = spinner(&format!("status: {}", op.status));
    let final_op = wait(
        name,
        |id| {
            let pb = pb.clone();
            async move {
                let body = client.get_agent(&id).await?;
                let op = Operation::from_body(body);
                pb.set_message(format!("status: {}", op.status));
                Ok(op)
            }
        },
        &policy,
    )
    .await?;
    pb.finish_and_clear();

    let ce = crate::util::color_enabled_stdout();
    println!(
        "{} Final status: {}",
        if final_op.status.eq_ignore_ascii_case("succeeded") {
            crate::util::sym_check(ce)
        } else {
            crate::util::sym_cross(ce)
        },
        final_op.status
    );
    Ok(())
}

async fn wait_for_deployment(
    client: &AgentsClient,
    name: &str,
    version: &str,
    timeout: u64,
    poll_interval: u64,
) -> Result<Operation> {
    let policy = PollPolicy::new(
        Duration::from_secs(timeout),
        Duration::from_secs(poll_interval),
        DEPLOY_TERMINAL,
    )?;
    let pb = spinner("provisioning...");
    let result = wait(
        version,
        |v| {
            let pb = pb.clone();
            async move {
                let body = client.get_version(name, &v).await?;
                let op = Operation::from_body(body);
                pb.set_message(format!("provisioning: {}", op.status));
                Ok(op)
            }
        },
        &policy,
    )
    .await;
    pb.finish_and_clear();
    Ok(result?)
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Wire shape of an image-based hosted agent, following the project SDK's
/// model vocabulary. The container gets told where its own project and the
/// OpenAI data plane live.
fn build_definition(endpoint: &str, spec: &AgentSpec) -> Value {
    let mut env = BTreeMap::new();
    env.insert("AZURE_AI_PROJECT_ENDPOINT".to_string(), endpoint.to_string());
    env.insert("AZURE_OPENAI_ENDPOINT".to_string(), derive_openai_endpoint(endpoint));
    env.insert("AZURE_OPENAI_DEPLOYMENT_NAME".to_string(), spec.model.clone());
    env.extend(spec.extra_env.clone());

    json!({
        "type": "image_based_hosted_agent",
        "container_protocol_versions": [
            { "protocol": "responses", "version": "v1" }
        ],
        "cpu": spec.cpu,
        "memory": spec.memory,
        "image": spec.image,
        "environment_variables": env,
    })
}

/// Projects expose the data plane on the matching Cognitive Services host;
/// anything else falls back to the endpoint itself.
fn derive_openai_endpoint(endpoint: &str) -> String {
    if let Ok(parsed) = url::Url::parse(endpoint) {
        if let Some(host) = parsed.host_str() {
            if let Some(account) = host.strip_suffix(".services.ai.azure.com") {
                return format!("https://{account}.cognitiveservices.azure.com/");
            }
        }
    }
    endpoint.to_string()
}

/// The collection comes back as `data` via the OpenAI-style envelope and
/// `value` via the ARM-style one; accept both.
fn agent_entries(body: &Value) -> Vec<Value> {
    body.get("data")
        .or_else(|| body.get("value"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

async fn acquire_token() -> Result<String> {
    if let Ok(token) = std::env::var("AZURE_AI_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let az = which::which("az")
        .context("az CLI not found. Install it and run 'az login', or set AZURE_AI_TOKEN.")?;
    let output = tokio::process::Command::new(az)
        .args([
            "account",
            "get-access-token",
            "--resource",
            "https://ai.azure.com",
            "--query",
            "accessToken",
            "-o",
            "tsv",
        ])
        .output()
        .await
        .context("run az account get-access-token")?;
    if !output.status.success() {
        bail!(
            "az account get-access-token failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        bail!("az returned an empty token; run 'az login' first");
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec() -> AgentSpec {
        AgentSpec {
            name: "demo-hosted-agent".to_string(),
            image: "acr.azurecr.io/agent:v1".to_string(),
            cpu: "1".to_string(),
            memory: "2Gi".to_string(),
            model: "gpt-4o-mini".to_string(),
            extra_env: BTreeMap::new(),
        }
    }

    #[test]
    fn openai_endpoint_derived_from_project_host() {
        assert_eq!(
            derive_openai_endpoint("https://myacct.services.ai.azure.com/api/projects/myproj"),
            "https://myacct.cognitiveservices.azure.com/"
        );
        // Unrecognized hosts fall back to the endpoint itself.
        assert_eq!(
            derive_openai_endpoint("https://gateway.example.com/proj"),
            "https://gateway.example.com/proj"
        );
    }

    #[test]
    fn definition_carries_protocol_resources_and_env() {
        let body = build_definition("https://myacct.services.ai.azure.com/api/projects/p", &spec());
        assert_eq!(body["type"], "image_based_hosted_agent");
        assert_eq!(body["container_protocol_versions"][0]["protocol"], "responses");
        assert_eq!(body["container_protocol_versions"][0]["version"], "v1");
        assert_eq!(body["cpu"], "1");
        assert_eq!(body["memory"], "2Gi");
        assert_eq!(body["image"], "acr.azurecr.io/agent:v1");
        let env = &body["environment_variables"];
        assert_eq!(env["AZURE_AI_PROJECT_ENDPOINT"], "https://myacct.services.ai.azure.com/api/projects/p");
        assert_eq!(env["AZURE_OPENAI_ENDPOINT"], "https://myacct.cognitiveservices.azure.com/");
        assert_eq!(env["AZURE_OPENAI_DEPLOYMENT_NAME"], "gpt-4o-mini");
    }

    #[test]
    fn manifest_env_survives_and_flags_override_manifest() {
        let mut manifest = AgentManifest {
            name: Some("from-manifest".to_string()),
            image: Some("acr.azurecr.io/agent:v1".to_string()),
            ..AgentManifest::default()
        };
        manifest
            .environment_variables
            .insert("EXTRA".to_string(), "1".to_string());

        let spec = AgentSpec::resolve(
            manifest,
            None,
            Some("from-flag".to_string()),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(spec.name, "from-flag");
        assert_eq!(spec.cpu, "1");
        assert_eq!(spec.memory, "2Gi");

        let body = build_definition("https://e", &spec);
        assert_eq!(body["environment_variables"]["EXTRA"], "1");
    }

    #[test]
    fn missing_image_everywhere_is_an_error() {
        let err = AgentSpec::resolve(AgentManifest::default(), None, None, None, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("--image"));
    }

    #[test]
    fn agent_listing_accepts_both_envelopes() {
        let openai_style = serde_json::json!({"data": [{"name": "a"}, {"name": "b"}]});
        let arm_style = serde_json::json!({"value": [{"name": "a"}]});
        assert_eq!(agent_entries(&openai_style).len(), 2);
        assert_eq!(agent_entries(&arm_style).len(), 1);
        assert_eq!(agent_entries(&serde_json::json!({})).len(), 0);
    }
}
