use crate::agent::ToolRegistry;
use crate::config::ServerConfig;
use crate::error::ProviderUnavailable;
use crate::mcp::McpSession;
use crate::traits::ToolSession;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedProvider {
    pub name: String,
    pub tools: Vec<String>,
}

/// Outcome of bringing up the configured tool providers.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub connected: Vec<ConnectedProvider>,
    pub failed: Vec<ProviderUnavailable>,
}

impl StartupReport {
    pub fn tool_count(&self) -> usize {
        self.connected.iter().map(|p| p.tools.len()).sum()
    }

    pub fn all_failed(&self) -> bool {
        self.connected.is_empty() && !self.failed.is_empty()
    }

    fn fail(&mut self, provider: &str, reason: anyhow::Error) {
        let failure = ProviderUnavailable {
            provider: provider.to_string(),
            reason,
        };
        warn!("{}", failure);
        self.failed.push(failure);
    }
}

/// Launches every configured tool server and registers its tools. A server
/// whose entry is malformed, or that fails to start, handshake or list its
/// tools within `connect_timeout`, is recorded in the report and skipped.
pub async fn connect_providers(
    config: &ServerConfig,
    registry: &ToolRegistry,
    connect_timeout: Duration,
) -> StartupReport {
    let mut report = StartupReport::default();

    for (name, entry) in &config.mcp_servers {
        let server = match entry.launch_config() {
            Ok(server) => server,
            Err(reason) => {
                report.fail(name, reason);
                continue;
            }
        };

        let connecting = McpSession::connect(name, server);
        let session = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(Ok(session)) => Arc::new(session) as Arc<dyn ToolSession>,
            Ok(Err(reason)) => {
                report.fail(name, reason);
                continue;
            }
            Err(_) => {
                report.fail(
                    name,
                    anyhow!("no initialize answer within {:?}", connect_timeout),
                );
                continue;
            }
        };
        register_provider(name, session, registry, connect_timeout, &mut report).await;
    }

    info!(
        "{} tool provider(s) connected with {} tool(s), {} failed",
        report.connected.len(),
        report.tool_count(),
        report.failed.len()
    );
    report
}

/// Lists the tools of an already connected session and adds them to the
/// registry, recording the outcome in `report`.
pub async fn register_provider(
    name: &str,
    session: Arc<dyn ToolSession>,
    registry: &ToolRegistry,
    list_timeout: Duration,
    report: &mut StartupReport,
) {
    let listed = match tokio::time::timeout(list_timeout, session.list_tools()).await {
        Ok(listed) => listed,
        Err(_) => Err(anyhow!("no answer within {:?}", list_timeout)),
    };

    match listed {
        Ok(tools) => {
            registry.register(name, tools, session);
            let names = registry.tools_of(name);
            info!("Connected to {} with tools: {:?}", name, names);
            report.connected.push(ConnectedProvider {
                name: name.to_string(),
                tools: names,
            });
        }
        Err(reason) => {
            if let Err(e) = session.shutdown().await {
                warn!("Failed to shut down '{}': {:#}", name, e);
            }
            report.fail(name, reason.context("tools/list failed"));
        }
    }
}
