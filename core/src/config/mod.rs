use crate::agent::loop_::{DEFAULT_MAX_TOKENS, DEFAULT_MAX_TURNS};
use crate::providers::anthropic::DEFAULT_ANTHROPIC_MODEL;
use crate::tools::postgres::DATA_INSIGHT_PROMPT;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATABOT_DIR: &str = ".databot";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: Option<String>,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub max_turns: usize,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub system_prompt: Option<String>,
    pub listen_addr: String,
    pub server_config: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: None,
            api_key: String::new(),
            base_url: None,
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_turns: DEFAULT_MAX_TURNS,
            model_timeout_secs: 120,
            tool_timeout_secs: 60,
            connect_timeout_secs: 30,
            system_prompt: Some(DATA_INSIGHT_PROMPT.to_string()),
            listen_addr: "127.0.0.1:8000".to_string(),
            server_config: PathBuf::from("server_config.json"),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        if config_exists() {
            load_config()
        } else {
            Ok(Config::default())
        }
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Budget for starting one tool server and listing its tools.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Launch parameters of one stdio tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
}

/// One `mcpServers` entry. Entries that do not describe a launchable server
/// are kept as raw JSON so the rest of the file still loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEntry {
    Launch(ToolServerConfig),
    Malformed(Value),
}

impl ServerEntry {
    pub fn launch_config(&self) -> Result<&ToolServerConfig> {
        match self {
            ServerEntry::Launch(config) => Ok(config),
            ServerEntry::Malformed(raw) => {
                let reason = match serde_json::from_value::<ToolServerConfig>(raw.clone()) {
                    Err(e) => anyhow!(e),
                    Ok(_) => anyhow!("unrecognized entry"),
                };
                Err(reason.context("Malformed tool server entry"))
            }
        }
    }
}

impl From<ToolServerConfig> for ServerEntry {
    fn from(config: ToolServerConfig) -> Self {
        ServerEntry::Launch(config)
    }
}

/// Contents of `server_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerEntry>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tool server config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse tool server config {}", path.display()))
    }

    pub fn with_server(mut self, name: impl Into<String>, server: ToolServerConfig) -> Self {
        self.mcp_servers.insert(name.into(), server.into());
        self
    }
}

pub fn get_databot_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(DATABOT_DIR)
}

pub fn get_config_path() -> PathBuf {
    get_databot_dir().join("config.toml")
}

pub fn ensure_databot_dir() -> Result<PathBuf> {
    let databot_dir = get_databot_dir();

    if !databot_dir.exists() {
        std::fs::create_dir_all(&databot_dir).with_context(|| {
            format!(
                "Failed to create databot directory at {}",
                databot_dir.display()
            )
        })?;
    }

    Ok(databot_dir)
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(config_path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::anyhow!(
                "Config file not found. Run 'databot onboard' to set up your configuration."
            )
        } else {
            anyhow::anyhow!("Failed to read config from {}: {}", config_path.display(), e)
        }
    })?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", config_path.display()))
}

pub fn save_config(config: &Config) -> Result<()> {
    ensure_databot_dir()?;
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &Config, config_path: &Path) -> Result<()> {
    let content =
        toml::to_string_pretty(config).with_context(|| "Failed to serialize config to TOML")?;

    std::fs::write(config_path, content)
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    Ok(())
}

pub fn config_exists() -> bool {
    get_config_path().exists()
}
