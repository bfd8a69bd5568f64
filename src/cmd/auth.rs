use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::io::{self, Read};

use crate::common::network::{api_url, default_client};
use crate::config;
use crate::util::{
    env_or_stored, load_stored_config, mask_secret, save_stored_config, set_api_key_in_config,
    unset_api_key_in_config,
};

pub async fn handle_auth(endpoint: Option<String>, unset_key: bool) -> Result<()> {
    let ce = crate::util::color_enabled_stdout();

    if unset_key {
        unset_api_key_in_config()?;
        println!("{} Removed stored APIM key.", crate::util::sym_check(ce));
        return Ok(());
    }

    if let Some(endpoint) = endpoint {
        let mut cfg = load_stored_config().unwrap_or_default();
        cfg.endpoint = Some(endpoint.trim_end_matches('/').to_string());
        save_stored_config(&cfg)?;
        println!(
            "{} Gateway endpoint saved: {}",
            crate::util::sym_check(ce),
            cfg.endpoint.as_deref().unwrap_or_default().blue().bold()
        );
    }

    // If a key is already available, show it masked and probe the gateway.
    let stored = load_stored_config().unwrap_or_default();
    if let Some(key) = env_or_stored("APIM_API_KEY", stored.api_key.as_deref()) {
        println!(
            "{} APIM key: {}",
            crate::util::sym_check(ce),
            mask_secret(&key).blue().bold()
        );
        probe_gateway(ce).await;
        return Ok(());
    }

    println!("Enter your APIM subscription key (or set APIM_API_KEY):");
    let key = match rpassword::read_password() {
        Ok(k) => k,
        Err(_) => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read key from stdin")?;
            buf
        }
    };
    if key.trim().is_empty() {
        bail!("APIM key cannot be empty");
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} Saving key...").unwrap());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    set_api_key_in_config(&key)?;
    pb.finish_with_message("Key saved");

    println!(
        "{} APIM key: {}",
        crate::util::sym_check(ce),
        mask_secret(key.trim()).blue().bold()
    );
    probe_gateway(ce).await;
    Ok(())
}

/// Best-effort reachability check; a missing endpoint or a refused key is
/// reported but never fails the command.
async fn probe_gateway(ce: bool) {
    let Ok(cfg) = config::load_gateway_config() else {
        println!(
            "{} No gateway endpoint configured yet; set APIM_ENDPOINT or run 'foundry-ops auth --endpoint <url>'.",
            crate::util::sym_question(ce)
        );
        return;
    };

    let Ok(client) = default_client(10) else { return };
    let url = api_url(&cfg.base_url_openai(), "/assistants", &cfg.api_version);
    match client.get(&url).header("api-key", &cfg.api_key).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} Gateway reachable at {}", crate::util::sym_check(ce), cfg.endpoint);
        }
        Ok(resp) => {
            println!(
                "{} Gateway responded {} — the key may be invalid or the APIM product not subscribed.",
                crate::util::sym_question(ce),
                resp.status()
            );
        }
        Err(_) => {
            println!(
                "{} Could not reach {} — check the endpoint.",
                crate::util::sym_question(ce),
                cfg.endpoint
            );
        }
    }
}
