use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location of the gateway config, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".lsp-gateway/config.toml";

/// Immutable settings for the container pool, bridges, sessions and prewarm.
///
/// Built once at startup and handed to every component by value or `Arc`;
/// nothing inside the LSP subsystem reads configuration from anywhere else.
#[derive(Debug, Clone)]
pub struct LspConfig {
    pub enabled: bool,
    pub image: String,
    /// Container runtime CLI, normally `docker`.
    pub runtime_cmd: String,
    /// Non-root user the container and the language server run as.
    pub container_user: String,
    pub connect_timeout: Duration,
    pub startup_grace: Duration,
    pub prewarm_on_login: bool,
    pub prewarm_timeout: Duration,
    pub prewarm_cooldown: Duration,
    pub prewarm_skip_saturation_percent: u32,
    pub idle_ttl: Duration,
    pub min_idle_containers: usize,
    pub max_sessions: usize,
    pub memory_mb: u32,
    pub cpus: String,
    pub pids_limit: u32,
    pub max_message_bytes: usize,
    pub cleanup_interval: Duration,
    pub allowed_origins: Vec<String>,
    /// Header set by the upstream auth proxy carrying the principal name.
    pub principal_header: String,
    /// Cookie carrying the durable browser session id.
    pub session_cookie: String,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "proginator-jdtls".to_string(),
            runtime_cmd: "docker".to_string(),
            container_user: "runner".to_string(),
            connect_timeout: Duration::from_millis(15_000),
            startup_grace: Duration::from_millis(750),
            prewarm_on_login: false,
            prewarm_timeout: Duration::from_millis(8_000),
            prewarm_cooldown: Duration::from_secs(120),
            prewarm_skip_saturation_percent: 90,
            idle_ttl: Duration::from_secs(300),
            min_idle_containers: 0,
            max_sessions: 50,
            memory_mb: 512,
            cpus: "1.0".to_string(),
            pids_limit: 100,
            max_message_bytes: 1_000_000,
            cleanup_interval: Duration::from_millis(30_000),
            allowed_origins: vec![
                "http://localhost:*".to_string(),
                "https://localhost:*".to_string(),
            ],
            principal_header: "x-forwarded-user".to_string(),
            session_cookie: "SESSION".to_string(),
        }
    }
}

/// Top-level gateway configuration: HTTP listener plus the LSP subsystem.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub dev_mode: bool,
    pub lsp: LspConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3142,
            dev_mode: false,
            lsp: LspConfig::default(),
        }
    }
}

/// Raw TOML structure for `.lsp-gateway/config.toml`
#[derive(Debug, Deserialize)]
struct ConfigToml {
    server: Option<ServerSection>,
    lsp: Option<LspSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LspSection {
    enabled: Option<bool>,
    image: Option<String>,
    runtime_cmd: Option<String>,
    container_user: Option<String>,
    connect_timeout_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
    prewarm_on_login: Option<bool>,
    prewarm_timeout_ms: Option<u64>,
    prewarm_cooldown_secs: Option<u64>,
    prewarm_skip_saturation_percent: Option<u32>,
    idle_ttl_secs: Option<u64>,
    min_idle_containers: Option<usize>,
    max_sessions: Option<usize>,
    memory_mb: Option<u32>,
    cpus: Option<String>,
    pids_limit: Option<u32>,
    max_message_bytes: Option<usize>,
    cleanup_interval_ms: Option<u64>,
    allowed_origins: Option<Vec<String>>,
    principal_header: Option<String>,
    session_cookie: Option<String>,
}

impl LspSection {
    fn apply(self, config: &mut LspConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(image) = self.image {
            config.image = image;
        }
        if let Some(runtime_cmd) = self.runtime_cmd {
            config.runtime_cmd = runtime_cmd;
        }
        if let Some(user) = self.container_user {
            config.container_user = user;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.startup_grace_ms {
            config.startup_grace = Duration::from_millis(ms);
        }
        if let Some(prewarm) = self.prewarm_on_login {
            config.prewarm_on_login = prewarm;
        }
        if let Some(ms) = self.prewarm_timeout_ms {
            config.prewarm_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.prewarm_cooldown_secs {
            config.prewarm_cooldown = Duration::from_secs(secs);
        }
        if let Some(percent) = self.prewarm_skip_saturation_percent {
            config.prewarm_skip_saturation_percent = percent;
        }
        if let Some(secs) = self.idle_ttl_secs {
            config.idle_ttl = Duration::from_secs(secs);
        }
        if let Some(min_idle) = self.min_idle_containers {
            config.min_idle_containers = min_idle;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(memory_mb) = self.memory_mb {
            config.memory_mb = memory_mb;
        }
        if let Some(cpus) = self.cpus {
            config.cpus = cpus;
        }
        if let Some(pids_limit) = self.pids_limit {
            config.pids_limit = pids_limit;
        }
        if let Some(max_bytes) = self.max_message_bytes {
            config.max_message_bytes = max_bytes;
        }
        if let Some(ms) = self.cleanup_interval_ms {
            config.cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(origins) = self.allowed_origins {
            config.allowed_origins = origins;
        }
        if let Some(header) = self.principal_header {
            config.principal_header = header.to_ascii_lowercase();
        }
        if let Some(cookie) = self.session_cookie {
            config.session_cookie = cookie;
        }
    }
}

impl GatewayConfig {
    /// Load config from `path`. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse config from TOML text, filling in defaults for missing fields.
    pub fn parse(content: &str) -> Result<Self> {
        let toml: ConfigToml = toml::from_str(content)?;

        let mut config = Self::default();
        if let Some(server) = toml.server {
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(dev_mode) = server.dev_mode {
                config.dev_mode = dev_mode;
            }
        }
        if let Some(lsp) = toml.lsp {
            lsp.apply(&mut config.lsp);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.lsp.prewarm_skip_saturation_percent > 100 {
            anyhow::bail!(
                "lsp.prewarm_skip_saturation_percent must be within 0..=100, got {}",
                self.lsp.prewarm_skip_saturation_percent
            );
        }
        if self.lsp.cleanup_interval.is_zero() {
            anyhow::bail!("lsp.cleanup_interval_ms must be greater than zero");
        }
        if self.lsp.cpus.parse::<f64>().map(|c| c <= 0.0).unwrap_or(true) {
            anyhow::bail!("lsp.cpus must be a positive number, got '{}'", self.lsp.cpus);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 3142);
        assert!(!config.dev_mode);
        assert!(!config.lsp.enabled);
        assert_eq!(config.lsp.image, "proginator-jdtls");
        assert_eq!(config.lsp.startup_grace, Duration::from_millis(750));
        assert_eq!(config.lsp.idle_ttl, Duration::from_secs(300));
        assert_eq!(config.lsp.max_sessions, 50);
        assert_eq!(config.lsp.max_message_bytes, 1_000_000);
        assert_eq!(config.lsp.prewarm_skip_saturation_percent, 90);
        assert_eq!(config.lsp.allowed_origins.len(), 2);
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(&dir.path().join("config.toml")).unwrap();
        assert!(!config.lsp.enabled);
        assert_eq!(config.lsp.memory_mb, 512);
    }

    #[test]
    fn test_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
port = 8080
dev_mode = true

[lsp]
enabled = true
image = "jdtls:21"
startup_grace_ms = 200
prewarm_on_login = true
prewarm_cooldown_secs = 5
idle_ttl_secs = 60
min_idle_containers = 2
max_sessions = 10
memory_mb = 1024
cpus = "0.5"
max_message_bytes = 4096
allowed_origins = ["https://learn.example.org"]
principal_header = "X-Remote-User"
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.dev_mode);
        assert!(config.lsp.enabled);
        assert_eq!(config.lsp.image, "jdtls:21");
        assert_eq!(config.lsp.startup_grace, Duration::from_millis(200));
        assert!(config.lsp.prewarm_on_login);
        assert_eq!(config.lsp.prewarm_cooldown, Duration::from_secs(5));
        assert_eq!(config.lsp.idle_ttl, Duration::from_secs(60));
        assert_eq!(config.lsp.min_idle_containers, 2);
        assert_eq!(config.lsp.max_sessions, 10);
        assert_eq!(config.lsp.memory_mb, 1024);
        assert_eq!(config.lsp.cpus, "0.5");
        assert_eq!(config.lsp.max_message_bytes, 4096);
        assert_eq!(config.lsp.allowed_origins, vec!["https://learn.example.org"]);
        assert_eq!(config.lsp.principal_header, "x-remote-user");
    }

    #[test]
    fn test_config_load_partial() {
        let config = GatewayConfig::parse("[lsp]\nenabled = true\n").unwrap();
        assert!(config.lsp.enabled);
        assert_eq!(config.port, 3142); // default
        assert_eq!(config.lsp.max_sessions, 50); // default
        assert_eq!(config.lsp.session_cookie, "SESSION"); // default
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(GatewayConfig::load(&path).is_err());
    }

    #[test]
    fn test_config_rejects_out_of_range_saturation_percent() {
        let err = GatewayConfig::parse("[lsp]\nprewarm_skip_saturation_percent = 150\n")
            .unwrap_err();
        assert!(err.to_string().contains("prewarm_skip_saturation_percent"));
    }

    #[test]
    fn test_config_rejects_non_numeric_cpus() {
        assert!(GatewayConfig::parse("[lsp]\ncpus = \"lots\"\n").is_err());
    }

    #[test]
    fn test_config_empty_lsp_section() {
        let config = GatewayConfig::parse("[lsp]\n").unwrap();
        assert!(!config.lsp.enabled);
        assert_eq!(config.lsp.image, "proginator-jdtls");
    }
}
