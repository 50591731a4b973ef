//! Gateway server command (`lsp-gateway serve`).

use std::path::Path;

use anyhow::Result;
use lsp_gateway::config::GatewayConfig;

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    enabled: Option<bool>,
    dev: bool,
) -> Result<()> {
    let mut config = GatewayConfig::load(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(enabled) = enabled {
        config.lsp.enabled = enabled;
    }
    if dev {
        config.dev_mode = true;
    }

    tracing::info!(
        config = %config_path.display(),
        port = config.port,
        lsp_enabled = config.lsp.enabled,
        image = %config.lsp.image,
        "Starting LSP gateway"
    );

    lsp_gateway::server::start_server(config).await
}
