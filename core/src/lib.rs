pub mod agent;
pub mod config;
pub mod error;
pub mod mcp;
pub mod providers;
pub mod tools;
pub mod traits;

pub use agent::{AgentLoop, ToolRegistry, Transcript};
pub use config::*;
pub use error::{ProviderUnavailable, TurnError, TurnResult};
pub use mcp::{McpServer, McpSession, Prompt, StartupReport, connect_providers};
pub use providers::*;
pub use tools::PostgresTools;
pub use traits::*;
