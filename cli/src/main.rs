use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use databot_core::config::{self, Config, ServerConfig};
use databot_core::tools::postgres::{self, DEFAULT_DATABASE_URL};
use databot_core::{
    AgentLoop, McpServer, PostgresTools, StartupReport, ToolRegistry, connect_providers, providers,
};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod chat;
mod onboard;
mod serve;
mod tools;

const DEFAULT_LOG_FILTER: &str = "databot=info,databot_core=info";

#[derive(Parser)]
#[command(name = "databot")]
#[command(about = "databot - ask questions about your data through MCP tool servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure provider, API key and model
    Onboard,
    /// Serve the agent over WebSocket at /ws
    Serve {
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// Chat from the terminal
    Chat {
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Connect to the configured tool servers and list their tools
    Tools,
    /// Run the Postgres tool server on stdin/stdout
    McpPostgres {
        #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let command = cli.command.unwrap_or_else(|| {
        if !config::config_exists() {
            Commands::Onboard
        } else {
            Commands::Chat { message: None }
        }
    });

    match command {
        Commands::Onboard => {
            let onboard_config = onboard::run_onboard().map_err(|e| {
                eprintln!("❌ Onboarding failed: {}", e);
                anyhow::anyhow!("Onboarding failed: {}", e)
            })?;
            config::save_config(&onboard_config)?;
        }
        Commands::Serve { addr } => {
            let config = Config::load_or_init()?;
            let addr = addr.unwrap_or_else(|| config.listen_addr.clone());
            let (agent, _) = build_agent(&config).await?;
            serve::run(agent, &addr).await?;
        }
        Commands::Chat { message } => {
            let config = Config::load_or_init()?;
            let (agent, report) = build_agent(&config).await?;
            let result = chat::run(&agent, &report, message).await;
            agent.tool_registry().shutdown().await;
            result?;
        }
        Commands::Tools => {
            let config = Config::load_or_init()?;
            let server_config = load_server_config(&config)?;
            let registry = ToolRegistry::new();
            let report =
                connect_providers(&server_config, &registry, config.connect_timeout()).await;
            tools::print_report(&report, &registry);
            registry.shutdown().await;
        }
        Commands::McpPostgres { database_url } => {
            let tools = Arc::new(PostgresTools::connect(&database_url).await?);
            McpServer::new("postgres-server", tools)
                .with_prompt(postgres::data_insight_prompt())
                .serve_stdio()
                .await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_server_config(config: &Config) -> Result<ServerConfig> {
    ServerConfig::load(&config.server_config).with_context(|| {
        format!(
            "Could not load tool server config from {}",
            config.server_config.display()
        )
    })
}

/// Builds the model, connects every configured tool server and wires both
/// into a conversation loop.
async fn build_agent(config: &Config) -> Result<(Arc<AgentLoop>, StartupReport)> {
    let model = providers::create_model(config)?;
    let server_config = load_server_config(config)?;

    let registry = Arc::new(ToolRegistry::new());
    let report = connect_providers(&server_config, &registry, config.connect_timeout()).await;
    if report.all_failed() {
        warn!("No tool server could be reached, answering without tools");
    }

    let agent = AgentLoop::new(model, registry)
        .with_system_prompt(config.system_prompt.clone())
        .with_max_tokens(config.max_tokens)
        .with_max_turns(config.max_turns)
        .with_model_timeout(config.model_timeout())
        .with_tool_timeout(config.tool_timeout());

    Ok((Arc::new(agent), report))
}
