mod cmd;
mod common;
mod config;
mod util;
mod wait;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "foundry-ops", version, about = "Operational CLI for Azure AI Foundry hosted agents and its OpenAI-compatible APIs", long_about = None, disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store and inspect the AI Gateway key and endpoint
    Auth {
        /// Save this gateway endpoint to the local config
        #[arg(long)]
        endpoint: Option<String>,
        /// Remove the stored APIM key
        #[arg(long)]
        unset_key: bool,
    },
    /// Manage hosted agents on an AI Foundry project
    Agent {
        #[command(subcommand)]
        command: cmd::agent::AgentCommands,
    },
    /// Exercise the Chat Completions API through the gateway
    Chat {
        /// Model deployment to use (default: configured DEFAULT_MODEL)
        #[arg(long, short)]
        model: Option<String>,
        /// Message to send
        #[arg(long, default_value = "Hello! What is Azure AI Foundry?")]
        message: String,
        /// Stream the response over SSE
        #[arg(long, short)]
        streaming: bool,
        /// Run a two-turn conversation
        #[arg(long)]
        multi_turn: bool,
        /// Run every chat test
        #[arg(long, short)]
        all: bool,
    },
    /// Exercise the Assistants API workflow through the gateway
    Assistants {
        /// Model deployment to use (default: configured DEFAULT_MODEL)
        #[arg(long, short)]
        model: Option<String>,
        /// List existing assistants instead of running the workflow
        #[arg(long, short)]
        list: bool,
        /// Keep the test assistant around afterwards
        #[arg(long)]
        no_cleanup: bool,
    },
    /// Exercise the Responses API through the gateway
    Responses {
        /// Model deployment to use (default: configured DEFAULT_MODEL)
        #[arg(long, short)]
        model: Option<String>,
        /// Message to send
        #[arg(long, default_value = "Briefly describe the main features of Azure AI Foundry.")]
        message: String,
        /// Run a two-turn conversation via previous_response_id
        #[arg(long)]
        multi_turn: bool,
        /// Run a background task and poll it to completion
        #[arg(long, short)]
        background: bool,
        /// Cancel a background response by id
        #[arg(long)]
        cancel: Option<String>,
        /// Run every responses test
        #[arg(long, short)]
        all: bool,
        /// Seconds to wait for a background task
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Auth { endpoint, unset_key } => cmd::auth::handle_auth(endpoint, unset_key).await,
        Commands::Agent { command } => cmd::agent::handle(command).await,
        Commands::Chat { model, message, streaming, multi_turn, all } => {
            let cfg = config::load_gateway_config()?;
            cmd::chat::handle_chat(&cfg, model, message, streaming, multi_turn, all).await
        }
        Commands::Assistants { model, list, no_cleanup } => {
            let cfg = config::load_gateway_config()?;
            cmd::assistants::handle_assistants(&cfg, model, list, no_cleanup).await
        }
        Commands::Responses { model, message, multi_turn, background, cancel, all, timeout } => {
            let cfg = config::load_gateway_config()?;
            cmd::responses::handle_responses(
                &cfg, model, message, multi_turn, background, cancel, all, timeout,
            )
            .await
        }
    }
}
