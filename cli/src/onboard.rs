use anyhow::{Context, Result};
use console::style;
use databot_core::config::{Config, ServerConfig, ToolServerConfig};
use databot_core::providers::anthropic::DEFAULT_ANTHROPIC_MODEL;
use databot_core::tools::postgres::DEFAULT_DATABASE_URL;
use dialoguer::{Input, Select};
use std::collections::BTreeMap;
use std::path::Path;

const BANNER: &str = r"
    -------------------------------------

     databot
     ask your database, get an answer

    -------------------------------------
";

const PROVIDERS: [&str; 2] = ["anthropic", "openai"];

fn print_step(step: usize, total: usize, title: &str) {
    println!();
    println!(
        "{}",
        style(format!("[{}/{}] {}", step, total, title))
            .cyan()
            .bold()
    );
    println!();
}

/// Server config launching this binary's own Postgres tool server, written
/// only when no file exists yet.
fn starter_server_config() -> ServerConfig {
    let command = std::env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "databot".to_string());

    let mut env = BTreeMap::new();
    env.insert("DATABASE_URL".to_string(), DEFAULT_DATABASE_URL.to_string());

    ServerConfig::default().with_server(
        "postgres",
        ToolServerConfig {
            command,
            args: vec!["mcp-postgres".to_string()],
            env: Some(env),
        },
    )
}

fn ensure_server_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let content = serde_json::to_string_pretty(&starter_server_config())?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

fn setup_provider() -> Result<String> {
    let selection = Select::new()
        .with_prompt("Select your model provider")
        .items(&PROVIDERS)
        .default(0)
        .interact()
        .context("Failed to select provider")?;

    Ok(PROVIDERS[selection].to_string())
}

fn setup_api_key(provider: &str) -> Result<String> {
    let api_key: String = Input::new()
        .with_prompt(format!(
            "Enter your {} API key (leave empty to use the environment)",
            provider
        ))
        .allow_empty(true)
        .interact_text()
        .context("Failed to read API key")?;

    Ok(api_key.trim().to_string())
}

fn setup_model(provider: &str) -> Result<String> {
    let models: &[&str] = match provider {
        "openai" => &["gpt-4o", "gpt-4o-mini", "gpt-4.1"],
        _ => &[
            DEFAULT_ANTHROPIC_MODEL,
            "claude-sonnet-4-20250514",
            "claude-3-5-haiku-20241022",
        ],
    };

    let selection = Select::new()
        .with_prompt("Select your model")
        .items(models)
        .default(0)
        .interact()
        .context("Failed to select model")?;

    Ok(models[selection].to_string())
}

pub fn run_onboard() -> Result<Config> {
    println!("{}", style(BANNER).cyan().bold());

    println!("  {}", style("Welcome to databot!").white().bold());
    println!(
        "  {}",
        style("This wizard sets up the model and the tool servers.").dim()
    );
    println!();

    print_step(1, 4, "Provider");
    let provider = setup_provider()?;

    print_step(2, 4, "API Key Setup");
    let api_key = setup_api_key(&provider)?;

    print_step(3, 4, "Model Selection");
    let model = setup_model(&provider)?;

    let config = Config {
        provider: Some(provider),
        api_key,
        model,
        ..Default::default()
    };

    print_step(4, 4, "Tool Servers");
    match ensure_server_config(&config.server_config) {
        Ok(true) => println!(
            "  {} Starter tool server config written to {}",
            style("✓").green(),
            style(config.server_config.display()).cyan()
        ),
        Ok(false) => println!(
            "  {} Using existing {}",
            style("✓").green(),
            style(config.server_config.display()).cyan()
        ),
        Err(e) => eprintln!(
            "  {} Warning: Could not create tool server config: {}",
            style("!").yellow(),
            e
        ),
    }

    println!();
    println!("  {} Configuration complete!", style("✓").green().bold());
    println!(
        "  {} Config saved to {}",
        style("→").green(),
        style(databot_core::config::get_config_path().display()).cyan()
    );
    println!();
    println!(
        "  {} You can now run: {} or {}",
        style("→").green(),
        style("databot chat").cyan().bold(),
        style("databot serve").cyan().bold()
    );
    println!();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn starter_server_config_is_written_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("server_config.json");

        assert!(ensure_server_config(&path).unwrap());
        let loaded = ServerConfig::load(&path).unwrap();
        let postgres = loaded.mcp_servers["postgres"].launch_config().unwrap();
        assert_eq!(postgres.args, vec!["mcp-postgres"]);
        assert_eq!(
            postgres.env.as_ref().unwrap()["DATABASE_URL"],
            DEFAULT_DATABASE_URL
        );

        std::fs::write(&path, r#"{"mcpServers": {}}"#).unwrap();
        assert!(!ensure_server_config(&path).unwrap());
        assert!(ServerConfig::load(&path).unwrap().mcp_servers.is_empty());
    }
}
