//! Configuration view and validation commands (`lsp-gateway config`).

use std::path::Path;

use anyhow::Result;
use lsp_gateway::config::GatewayConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = GatewayConfig::load(config_path)?;

            println!();
            println!("LSP Gateway Configuration");
            println!("=========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: {} (not found, using defaults)", config_path.display());
            }
            println!();
            print_config(&config);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file at {}; defaults apply.", config_path.display());
                return Ok(());
            }
            let config = GatewayConfig::load(config_path)?;

            let mut warnings = Vec::new();
            if !config.lsp.enabled {
                warnings.push("lsp.enabled is false; /lsp connections will be refused".to_string());
            }
            if config.lsp.prewarm_on_login && !config.lsp.enabled {
                warnings.push("lsp.prewarm_on_login has no effect while lsp.enabled is false".to_string());
            }
            if config.lsp.min_idle_containers > config.lsp.max_sessions {
                warnings.push(format!(
                    "lsp.min_idle_containers ({}) exceeds lsp.max_sessions ({})",
                    config.lsp.min_idle_containers, config.lsp.max_sessions
                ));
            }
            if config.lsp.allowed_origins.is_empty() {
                warnings.push("lsp.allowed_origins is empty; browsers sending Origin will be rejected".to_string());
            }

            println!("Configuration is valid: {}", config_path.display());
            for warning in &warnings {
                println!("  warning: {}", warning);
            }
        }
    }

    Ok(())
}

fn print_config(config: &GatewayConfig) {
    let lsp = &config.lsp;

    println!("[server]");
    println!("  port = {}", config.port);
    println!("  dev_mode = {}", config.dev_mode);
    println!();

    println!("[lsp]");
    println!("  enabled = {}", lsp.enabled);
    println!("  image = \"{}\"", lsp.image);
    println!("  runtime_cmd = \"{}\"", lsp.runtime_cmd);
    println!("  container_user = \"{}\"", lsp.container_user);
    println!("  connect_timeout_ms = {}", lsp.connect_timeout.as_millis());
    println!("  startup_grace_ms = {}", lsp.startup_grace.as_millis());
    println!("  prewarm_on_login = {}", lsp.prewarm_on_login);
    println!("  prewarm_timeout_ms = {}", lsp.prewarm_timeout.as_millis());
    println!("  prewarm_cooldown_secs = {}", lsp.prewarm_cooldown.as_secs());
    println!(
        "  prewarm_skip_saturation_percent = {}",
        lsp.prewarm_skip_saturation_percent
    );
    println!("  idle_ttl_secs = {}", lsp.idle_ttl.as_secs());
    println!("  min_idle_containers = {}", lsp.min_idle_containers);
    println!("  max_sessions = {}", lsp.max_sessions);
    println!("  memory_mb = {}", lsp.memory_mb);
    println!("  cpus = \"{}\"", lsp.cpus);
    println!("  pids_limit = {}", lsp.pids_limit);
    println!("  max_message_bytes = {}", lsp.max_message_bytes);
    println!("  cleanup_interval_ms = {}", lsp.cleanup_interval.as_millis());
    println!("  allowed_origins = {:?}", lsp.allowed_origins);
    println!("  principal_header = \"{}\"", lsp.principal_header);
    println!("  session_cookie = \"{}\"", lsp.session_cookie);
}
